//! crossnet-server: echo server and relay proxy
//!
//! Both payloads answer every path. The echo server sleeps for a configured
//! delay so load-balancer behaviour under slow backends is observable; the
//! relay forwards one GET to its target and reports what came back.

pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ServerError;
pub use server::{PayloadServer, ServerBuilder};
pub use state::{local_hostname, AppState, Mode, SharedState};
