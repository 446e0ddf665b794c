//! HTTP routes for the payload servers

use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Result, ServerError};
use crate::metrics;
use crate::state::{Mode, SharedState};

async fn healthz() -> &'static str {
    "ok"
}

async fn prometheus(State(state): State<SharedState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Catch-all handler for every other path
async fn payload(State(state): State<SharedState>) -> Result<String> {
    let mode = state.mode.label();
    let started = Instant::now();
    metrics::record_request_start(mode);

    let result = respond(&state).await;

    metrics::record_request_end(mode);
    let outcome = if result.is_ok() {
        metrics::OUTCOME_OK
    } else {
        metrics::OUTCOME_UPSTREAM_ERROR
    };
    metrics::record_request(mode, outcome, started.elapsed());

    result
}

async fn respond(state: &SharedState) -> Result<String> {
    match &state.mode {
        Mode::Echo { delay } => {
            tokio::time::sleep(*delay).await;
            Ok(state.echo_body())
        }
        Mode::Relay { client, target } => match client.fetch(target).await {
            Ok(resp) => {
                metrics::record_upstream(Some(resp.status));
                Ok(state.relay_body(target, resp.status, &resp.body))
            }
            Err(source) => {
                metrics::record_upstream(None);
                tracing::warn!(upstream = %target, error = %source, "Relay request failed");
                Err(ServerError::Upstream {
                    target: target.clone(),
                    hostname: state.hostname.clone(),
                    service: state.service.clone(),
                    source,
                })
            }
        },
    }
}

/// Create the router with all routes
pub fn create_router(state: SharedState, concurrency: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus))
        .fallback(payload)
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(concurrency.max(1)))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use crossnet_client::ProbeClient;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn echo_state(delay: Duration) -> SharedState {
        Arc::new(AppState::new("h", "svc", Mode::Echo { delay }))
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_answers_any_path_after_delay() {
        let router = create_router(echo_state(Duration::from_secs(10)), 8);
        let started = tokio::time::Instant::now();

        let (status, body) = get_body(router, "/some/deep/path").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\nHostname: h\nService: svc\n");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_healthz_skips_delay() {
        let router = create_router(echo_state(Duration::from_secs(3600)), 8);
        let (status, body) = get_body(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics_absent_without_recorder() {
        let router = create_router(echo_state(Duration::ZERO), 8);
        let (status, _) = get_body(router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_relay_unreachable_target_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let client = ProbeClient::new(Duration::from_secs(2)).unwrap();
        let state = Arc::new(AppState::new(
            "h",
            "relay",
            Mode::Relay {
                client,
                target: target.clone(),
            },
        ));

        let (status, body) = get_body(create_router(state, 8), "/").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.starts_with(&format!("ERROR proxying to {}: ", target)));
        assert!(body.ends_with("\nHostname: h\nService: relay\n"));
    }
}
