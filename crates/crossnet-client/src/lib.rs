//! crossnet-client: probe client used by the spoke test jobs and the relay
//!
//! The job binary reads `TARGET_URL`, issues one bounded-timeout GET and
//! prints what came back. Receiving any HTTP response counts as success; only
//! a transport failure is the probe's own failure.

pub mod client;
pub mod error;

pub use client::{
    ProbeArgs, ProbeClient, ProbeConfig, ProbeResponse, DEFAULT_TIMEOUT, TARGET_URL_VAR,
};
pub use error::{ClientError, Result};
