// Notification agent: keeps one user's feed in sync and logs every change.
mod config;
mod observability;

use anyhow::{Context, Result};
use chime_client::{ConnectionState, NotificationSession, Snapshot, SyncHealth};
use chime_common::UserId;
use clap::Parser;
use futures::{Stream, StreamExt};
use std::future::Future;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chime-agent")]
#[command(about = "Real-time notification sync for one user")]
struct Args {
    /// User to sync (falls back to CHIME_USER_ID)
    #[arg(long)]
    user: Option<String>,

    /// Client config YAML (falls back to CHIME_CLIENT_CONFIG)
    #[arg(long)]
    config: Option<String>,

    /// Ask the backend to create one notification for the user after start
    #[arg(long, default_value_t = false)]
    send: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    run_with_shutdown(args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(args: Args, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("chime-agent")?;
    let config = config::AgentConfig::from_env_or_yaml(args.config.as_deref())?;
    let user = match args.user {
        Some(raw) => UserId::new(raw).context("parse --user")?,
        None => config
            .user_id
            .clone()
            .context("no user: pass --user or set CHIME_USER_ID")?,
    };

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            warn!(error = %err, "metrics listener exited");
        }
    });

    let session = NotificationSession::from_config(&config.sync)?;
    let watcher = tokio::spawn(watch_session(
        session.changes(),
        session.health(),
        session.connection_states(),
    ));
    session.start(user.clone())?;
    info!(
        user = %user,
        backend = %config.sync.backend_url,
        push = %config.sync.push_url,
        "agent started"
    );

    if args.send {
        match session.send_to_self().await {
            Ok(receipt) => info!(receipt = %receipt, "notification requested"),
            Err(err) => warn!(error = %err, "send failed"),
        }
    }

    shutdown.await;
    session.stop();
    watcher.abort();
    info!(user = %user, "agent stopped");
    Ok(())
}

async fn watch_session(
    mut changes: watch::Receiver<Snapshot>,
    mut health: watch::Receiver<SyncHealth>,
    states: impl Stream<Item = ConnectionState>,
) {
    let mut states = std::pin::pin!(states);
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = changes.borrow_and_update().clone();
                log_snapshot(&snapshot);
            }
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                match *health.borrow_and_update() {
                    SyncHealth::Healthy => info!("sync healthy"),
                    SyncHealth::Degraded { consecutive_failures } => {
                        warn!(consecutive_failures, "sync degraded")
                    }
                }
            }
            state = states.next() => {
                let Some(state) = state else {
                    break;
                };
                info!(state = ?state, "connection state");
            }
        }
    }
}

fn log_snapshot(snapshot: &Snapshot) {
    let Some(newest) = snapshot.iter().next() else {
        info!(version = snapshot.version, "no notifications yet");
        return;
    };
    info!(
        version = snapshot.version,
        records = snapshot.len(),
        newest_id = %newest.id,
        newest_message = %newest.message,
        "notifications updated"
    );
}
