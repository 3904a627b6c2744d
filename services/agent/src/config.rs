use anyhow::{Context, Result};
use chime_client::SyncConfig;
use chime_common::UserId;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Agent configuration sourced from environment variables, then YAML.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub user_id: Option<UserId>,
    pub metrics_bind: SocketAddr,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize)]
struct AgentConfigOverride {
    user_id: Option<String>,
    metrics_bind: Option<String>,
}

impl AgentConfig {
    /// `client_config` points at the sync YAML; `CHIME_CLIENT_CONFIG` otherwise.
    pub fn from_env(client_config: Option<&str>) -> Result<Self> {
        let metrics_bind = std::env::var("CHIME_AGENT_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse CHIME_AGENT_METRICS_BIND")?;
        let user_id = match std::env::var("CHIME_USER_ID") {
            Ok(value) if !value.trim().is_empty() => {
                Some(UserId::new(value.trim()).with_context(|| "parse CHIME_USER_ID")?)
            }
            _ => None,
        };
        Ok(Self {
            user_id,
            metrics_bind,
            sync: SyncConfig::from_env_or_yaml(client_config)?,
        })
    }

    pub fn from_env_or_yaml(client_config: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env(client_config)?;
        if let Ok(path) = std::env::var("CHIME_AGENT_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CHIME_AGENT_CONFIG: {path}"))?;
            let override_cfg: AgentConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse agent config yaml")?;
            if let Some(value) = override_cfg.user_id {
                config.user_id = Some(UserId::new(value).with_context(|| "parse user_id")?);
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clear_all() -> Vec<EnvGuard> {
        [
            "CHIME_AGENT_METRICS_BIND",
            "CHIME_USER_ID",
            "CHIME_AGENT_CONFIG",
            "CHIME_CLIENT_CONFIG",
            "CHIME_BACKEND_URL",
        ]
        .into_iter()
        .map(EnvGuard::unset)
        .collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() -> Result<()> {
        let _guards = clear_all();
        let config = AgentConfig::from_env_or_yaml(None)?;
        assert_eq!(config.metrics_bind, "0.0.0.0:9090".parse::<SocketAddr>()?);
        assert!(config.user_id.is_none());
        assert_eq!(config.sync, SyncConfig::default());
        Ok(())
    }

    #[test]
    #[serial]
    fn env_values_apply() -> Result<()> {
        let _guards = clear_all();
        let _g1 = EnvGuard::set("CHIME_AGENT_METRICS_BIND", "127.0.0.1:9100");
        let _g2 = EnvGuard::set("CHIME_USER_ID", " 42 ");
        let _g3 = EnvGuard::set("CHIME_BACKEND_URL", "http://backend:8000/api");
        let config = AgentConfig::from_env_or_yaml(None)?;
        assert_eq!(config.metrics_bind.port(), 9100);
        assert_eq!(config.user_id.as_ref().map(UserId::as_str), Some("42"));
        assert_eq!(config.sync.backend_url, "http://backend:8000/api");
        Ok(())
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _guards = clear_all();
        let path = std::env::temp_dir().join(format!("chime-agent-{}.yaml", std::process::id()));
        fs::write(&path, "user_id: \"7\"\nmetrics_bind: \"127.0.0.1:9200\"\n")?;
        let _g1 = EnvGuard::set("CHIME_USER_ID", "42");
        let _g2 = EnvGuard::set("CHIME_AGENT_CONFIG", &path.to_string_lossy());
        let config = AgentConfig::from_env_or_yaml(None);
        let _ = fs::remove_file(&path);
        let config = config?;
        assert_eq!(config.user_id.as_ref().map(UserId::as_str), Some("7"));
        assert_eq!(config.metrics_bind.port(), 9200);
        Ok(())
    }

    #[test]
    #[serial]
    fn bad_bind_is_rejected() {
        let _guards = clear_all();
        let _g = EnvGuard::set("CHIME_AGENT_METRICS_BIND", "not-an-addr");
        assert!(AgentConfig::from_env_or_yaml(None).is_err());
    }
}
