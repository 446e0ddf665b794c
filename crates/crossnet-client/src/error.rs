//! Client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("TARGET_URL environment variable is required")]
    MissingTarget,

    /// No HTTP response was received (timeout, refused connection, DNS)
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
