//! Provisioner error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Core(#[from] crossnet_core::Error),

    /// The CLI ran and exited non-zero
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("step graph: {0}")]
    Graph(String),

    #[error("{0} is not supported")]
    Unsupported(String),

    /// A deferred environment value was not resolved before creation
    #[error("unresolved environment variable {0}")]
    Unresolved(String),

    /// Failure injected by the in-memory control plane
    #[error("injected failure: {0}")]
    Injected(String),

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProvisionError::NotFound(_) => true,
            ProvisionError::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn at_step(self, step: impl Into<String>) -> Self {
        ProvisionError::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
