//! Server error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crossnet_client::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// The relay target could not be reached
    #[error("ERROR proxying to {target}: {source}\nHostname: {hostname}\nService: {service}\n")]
    Upstream {
        target: String,
        hostname: String,
        service: String,
        #[source]
        source: ClientError,
    },

    #[error("Client setup failed: {0}")]
    Client(#[from] ClientError),

    #[error("Metrics recorder: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
