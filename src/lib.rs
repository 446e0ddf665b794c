//! crossnet: serverless workloads on colliding ranges reaching a shared hub
//!
//! Umbrella crate over the workspace members; the end-to-end tests under
//! `tests/` use it to drive several crates together.

pub use crossnet_client as client;
pub use crossnet_core as model;
pub use crossnet_provisioner as provisioner;
pub use crossnet_server as server;
