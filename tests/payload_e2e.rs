//! End-to-end payload tests
//!
//! Real echo and relay servers on 127.0.0.1, driven over HTTP by the probe
//! client and by reqwest.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use axum::{http::StatusCode, routing::get, Router};
use crossnet_client::{ProbeClient, ProbeConfig};
use crossnet_server::{Mode, ServerBuilder};
use futures::future::join_all;
use tokio::net::TcpListener;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19300);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// A payload server running until the harness is dropped
struct TestServer {
    url: String,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    async fn start(router: Router) -> Self {
        let port = next_port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let listener = TcpListener::bind(addr).await.expect("Bind should succeed");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Self {
            url: format!("http://127.0.0.1:{}", port),
            _shutdown: shutdown_tx,
        }
    }

    async fn echo(delay: Duration, service: &str) -> Self {
        let server = ServerBuilder::new(Mode::Echo { delay })
            .hostname("echo-host")
            .service(service)
            .build()
            .expect("Build should succeed");
        Self::start(server.router()).await
    }

    async fn relay(target: &str, timeout: Duration) -> Self {
        let client = ProbeClient::new(timeout).expect("Client should build");
        let server = ServerBuilder::new(Mode::Relay {
            client,
            target: target.to_string(),
        })
        .hostname("relay-host")
        .service("spoke1-relay-1")
        .build()
        .expect("Build should succeed");
        Self::start(server.router()).await
    }
}

#[tokio::test]
async fn test_echo_contract() {
    let delay = Duration::from_millis(300);
    let server = TestServer::echo(delay, "crossnet-spoke1-echo").await;

    let started = Instant::now();
    let resp = reqwest::get(format!("{}/any/path?x=1", server.url)).await.unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(
        resp.text().await.unwrap(),
        "OK\nHostname: echo-host\nService: crossnet-spoke1-echo\n"
    );
}

#[tokio::test]
async fn test_echo_requests_overlap() {
    let delay = Duration::from_millis(500);
    let server = TestServer::echo(delay, "svc").await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let requests = (0..8).map(|_| client.get(format!("{}/", server.url)).send());
    let responses = join_all(requests).await;

    for resp in responses {
        assert_eq!(resp.unwrap().status(), 200);
    }
    assert!(started.elapsed() < delay * 4, "requests were serialized");
}

#[tokio::test]
async fn test_probe_against_echo() {
    let server = TestServer::echo(Duration::ZERO, "svc").await;
    let url = format!("{}/", server.url);
    let config = ProbeConfig::new(url);

    let client = ProbeClient::new(config.timeout).unwrap();
    let resp = client.fetch(&config.target_url).await.unwrap();
    assert_eq!(
        resp.render(),
        "Status: 200\nBody:\nOK\nHostname: echo-host\nService: svc\n"
    );
}

#[tokio::test]
async fn test_relay_reports_upstream() {
    let echo = TestServer::echo(Duration::ZERO, "hub").await;
    let target = format!("{}/", echo.url);
    let relay = TestServer::relay(&target, Duration::from_secs(5)).await;

    let resp = reqwest::get(format!("{}/", relay.url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.text().await.unwrap(),
        format!(
            "Proxy OK\nHostname: relay-host\nService: spoke1-relay-1\nTarget: {}\n\
             Target status: 200\nTarget body:\nOK\nHostname: echo-host\nService: hub\n\n",
            target
        )
    );
}

#[tokio::test]
async fn test_relay_passes_through_error_status() {
    let upstream = TestServer::start(
        Router::new().fallback(get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") })),
    )
    .await;
    let relay = TestServer::relay(&upstream.url, Duration::from_secs(5)).await;

    let resp = reqwest::get(&relay.url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("Target status: 503\n"));
    assert!(body.ends_with("Target body:\ndown\n"));
}

#[tokio::test]
async fn test_relay_unreachable_is_bad_gateway() {
    let target = format!("http://127.0.0.1:{}/", next_port());
    let relay = TestServer::relay(&target, Duration::from_secs(2)).await;

    let resp = reqwest::get(&relay.url).await.unwrap();
    assert_eq!(resp.status(), 502);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with(&format!("ERROR proxying to {}: ", target)));
    assert!(body.ends_with("Hostname: relay-host\nService: spoke1-relay-1\n"));
}

#[tokio::test]
async fn test_relay_timeout_is_bad_gateway() {
    let slow = TestServer::echo(Duration::from_secs(5), "slow").await;
    let relay = TestServer::relay(&slow.url, Duration::from_millis(200)).await;

    let started = Instant::now();
    let resp = reqwest::get(&relay.url).await.unwrap();
    assert_eq!(resp.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_health_does_not_wait() {
    let server = TestServer::echo(Duration::from_secs(30), "svc").await;
    let resp = reqwest::Client::new()
        .get(format!("{}/healthz", server.url))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
