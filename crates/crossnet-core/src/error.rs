//! Error types for crossnet-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Colliding range {range} reachable from {context}")]
    Collision { range: String, context: String },

    #[error("Range {a} overlaps {b}")]
    RangeOverlap { a: String, b: String },
}
