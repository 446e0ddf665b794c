//! Single-request probe client

use std::time::Duration;

use clap::Parser;
use reqwest::Client;

use crate::error::{ClientError, Result};

/// Environment variable holding the probe target
pub const TARGET_URL_VAR: &str = "TARGET_URL";

/// Timeout used by the probe job
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line and environment of the probe job
#[derive(Parser, Debug, Clone)]
#[command(name = "crossnet-probe")]
#[command(about = "Send one GET to TARGET_URL and print the response")]
pub struct ProbeArgs {
    #[arg(long, env = "TARGET_URL")]
    pub target_url: Option<String>,

    /// Request timeout in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,
}

impl ProbeArgs {
    /// `TARGET_URL` is required and must not be blank
    pub fn into_config(self) -> Result<ProbeConfig> {
        let target_url = self
            .target_url
            .filter(|t| !t.trim().is_empty())
            .ok_or(ClientError::MissingTarget)?;
        Ok(ProbeConfig {
            target_url,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Where to send the probe and how long to wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub target_url: String,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Status and body of whatever the target answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Status: <code>\nBody:\n<body>`
    pub fn render(&self) -> String {
        format!("Status: {}\nBody:\n{}", self.status, self.body)
    }
}

/// HTTP client with a bounded per-request timeout
#[derive(Debug, Clone)]
pub struct ProbeClient {
    http: Client,
    timeout: Duration,
}

impl ProbeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url`.
    ///
    /// Any HTTP response, including non-2xx, is `Ok`; only a failure to get a
    /// response at all is an error.
    pub async fn fetch(&self, url: &str) -> Result<ProbeResponse> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status().as_u16();

        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(url, status, error = %e, "Response body could not be read");
                String::new()
            }
        };

        tracing::debug!(url, status, bytes = body.len(), "Probe response");
        Ok(ProbeResponse { status, body })
    }
}
