// Real-time notification sync for one user session.
//
// Push events are treated as resync signals only: every change reaches the store
// through a pull from the REST backend, merged idempotently. The pieces, leaves
// first: store, subscriptions, connection manager, dispatcher, session.
pub mod backend;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod session;
pub mod store;
pub mod subscription;

pub use backend::{BackendError, HttpBackend, NotificationBackend};
pub use backoff::{Backoff, BackoffPolicy};
pub use config::SyncConfig;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState};
pub use dispatcher::{SyncDispatcher, SyncError, SyncHealth};
pub use session::{NotificationSession, SessionError, SessionPhase};
pub use store::{MergeOutcome, NotificationStore, Snapshot};
pub use subscription::{ChannelSubscription, SubscriptionHandle, SubscriptionState};

#[cfg(test)]
mod tests;
