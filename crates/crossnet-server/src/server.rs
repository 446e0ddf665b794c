//! Payload server implementation

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::error::{Result, ServerError};
use crate::metrics::init_prometheus_recorder;
use crate::routes::create_router;
use crate::state::{local_hostname, AppState, Mode, SharedState};

/// Requests served at once per instance
pub const DEFAULT_CONCURRENCY: usize = 80;

pub const DEFAULT_PORT: u16 = 8080;

/// Echo or relay payload bound to one address
pub struct PayloadServer {
    state: SharedState,
    addr: SocketAddr,
    concurrency: usize,
}

impl PayloadServer {
    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.concurrency)
    }

    /// Run the server until the process is stopped
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        tracing::info!(
            mode = self.state.mode.label(),
            addr = %self.addr,
            "Listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server state for testing
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }
}

/// Builder for PayloadServer
pub struct ServerBuilder {
    mode: Mode,
    addr: SocketAddr,
    hostname: Option<String>,
    service: String,
    concurrency: usize,
    metrics: bool,
}

impl ServerBuilder {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            addr: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            hostname: None,
            service: String::new(),
            concurrency: DEFAULT_CONCURRENCY,
            metrics: false,
        }
    }

    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.addr = ([0, 0, 0, 0], port).into();
        self
    }

    /// Override the reported hostname (defaults to the kernel hostname)
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Install the global Prometheus recorder and serve it on `/metrics`
    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    pub fn build(self) -> Result<PayloadServer> {
        let hostname = self.hostname.unwrap_or_else(local_hostname);
        let mut state = AppState::new(hostname, self.service, self.mode);

        if self.metrics {
            state.metrics = Some(init_prometheus_recorder()?);
        }

        Ok(PayloadServer {
            state: Arc::new(state),
            addr: self.addr,
            concurrency: self.concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder_defaults() {
        let server = ServerBuilder::new(Mode::Echo {
            delay: Duration::ZERO,
        })
        .hostname("h")
        .build()
        .unwrap();

        assert_eq!(server.addr().port(), DEFAULT_PORT);
        assert!(server.addr().ip().is_unspecified());
        assert_eq!(server.state().hostname, "h");
        assert_eq!(server.state().service, "");
        assert!(server.state().metrics.is_none());
    }

    #[test]
    fn test_builder_port_and_service() {
        let server = ServerBuilder::new(Mode::Echo {
            delay: Duration::ZERO,
        })
        .port(9090)
        .service("crossnet-spoke2-echo")
        .build()
        .unwrap();

        assert_eq!(server.addr().port(), 9090);
        assert_eq!(server.state().service, "crossnet-spoke2-echo");
    }
}
