//! Server state: instance identity and payload mode

use std::sync::Arc;
use std::time::Duration;

use crossnet_client::ProbeClient;
use metrics_exporter_prometheus::PrometheusHandle;

/// What the catch-all route does
#[derive(Debug, Clone)]
pub enum Mode {
    /// Sleep, then answer with the instance identity
    Echo { delay: Duration },
    /// Forward one GET to `target` and report the upstream answer
    Relay { client: ProbeClient, target: String },
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Echo { .. } => "echo",
            Mode::Relay { .. } => "relay",
        }
    }
}

pub struct AppState {
    pub hostname: String,
    /// Value of `K_SERVICE`, empty outside the serverless runtime
    pub service: String,
    pub mode: Mode,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(hostname: impl Into<String>, service: impl Into<String>, mode: Mode) -> Self {
        Self {
            hostname: hostname.into(),
            service: service.into(),
            mode,
            metrics: None,
        }
    }

    pub fn echo_body(&self) -> String {
        format!("OK\nHostname: {}\nService: {}\n", self.hostname, self.service)
    }

    pub fn relay_body(&self, target: &str, status: u16, body: &str) -> String {
        format!(
            "Proxy OK\nHostname: {}\nService: {}\n\
             Target: {}\nTarget status: {}\nTarget body:\n{}\n",
            self.hostname, self.service, target, status, body
        )
    }
}

pub type SharedState = Arc<AppState>;

/// Kernel hostname, falling back to `$HOSTNAME`
pub fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_body() {
        let state = AppState::new(
            "host-a",
            "crossnet-spoke1-echo",
            Mode::Echo {
                delay: Duration::ZERO,
            },
        );
        assert_eq!(
            state.echo_body(),
            "OK\nHostname: host-a\nService: crossnet-spoke1-echo\n"
        );
    }

    #[test]
    fn test_relay_body() {
        let client = ProbeClient::new(Duration::from_secs(1)).unwrap();
        let state = AppState::new(
            "host-b",
            "relay",
            Mode::Relay {
                client,
                target: "http://10.0.0.2/".into(),
            },
        );
        assert_eq!(state.mode.label(), "relay");
        assert_eq!(
            state.relay_body("http://10.0.0.2/", 200, "hello"),
            "Proxy OK\nHostname: host-b\nService: relay\n\
             Target: http://10.0.0.2/\nTarget status: 200\nTarget body:\nhello\n"
        );
    }
}
