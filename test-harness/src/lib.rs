// Test doubles for the notification backend and the push gateway.
//
// `FakeBackend` serves the REST pull/send endpoints from memory; `Gateway`
// speaks the push wire protocol over WebSocket and routes through an in-process
// `chime_broker::Broker`, so tests can sever or refuse connections at will.
pub mod backend;
pub mod gateway;

pub use backend::{FakeBackend, RunningBackend};
pub use gateway::{Gateway, GatewayOptions};
