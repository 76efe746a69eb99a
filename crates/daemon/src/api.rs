// Tun Proxy - REST API Module
// Handles HTTP API endpoints for tunnel control

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tun_proxy_common::{Error, FilterMode, RemoteStartRequest, StatusEvent, Utc};

use crate::controller::TunnelController;
use crate::remote::RemoteService;

/// Shared application state
pub struct AppState {
    pub controller: Arc<TunnelController>,
    pub remote: Arc<RemoteService>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/tunnel/start", post(start_tunnel))
        .route("/api/tunnel/stop", post(stop_tunnel))
        .route("/api/remote/start-allowed", post(remote_start_allowed))
        .route("/api/remote/start-denied", post(remote_start_denied))
        .route("/api/remote/stop", post(remote_stop))
        .route("/api/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// Start the tunnel
async fn start_tunnel(State(state): State<Arc<AppState>>) -> Response {
    info!("API: Start tunnel request");

    let controller = Arc::clone(&state.controller);
    match tokio::task::spawn_blocking(move || controller.start()).await {
        Ok(Ok(outcome)) => {
            info!("Start finished: {:?}", outcome);
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to start tunnel: {}", e);
            let status = match &e {
                Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e.to_string())
        }
        Err(e) => {
            error!("Start task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Stop the tunnel
async fn stop_tunnel(State(state): State<Arc<AppState>>) -> Response {
    info!("API: Stop tunnel request");

    let controller = Arc::clone(&state.controller);
    match tokio::task::spawn_blocking(move || controller.stop()).await {
        Ok(Ok(outcome)) => {
            info!("Stop finished: {:?}", outcome);
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to stop tunnel: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Stop task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn remote_start_allowed(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemoteStartRequest>,
) -> Response {
    remote_start(state, FilterMode::Allow, request).await
}

async fn remote_start_denied(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemoteStartRequest>,
) -> Response {
    remote_start(state, FilterMode::Deny, request).await
}

async fn remote_start(state: Arc<AppState>, mode: FilterMode, request: RemoteStartRequest) -> Response {
    info!("API: Remote start ({}) request", mode);

    let remote = Arc::clone(&state.remote);
    let task = tokio::task::spawn_blocking(move || match mode {
        FilterMode::Allow => remote.start_allowed(&request.host, request.port, &request.apps, None),
        FilterMode::Deny => remote.start_denied(&request.host, request.port, &request.apps, None),
    });
    match task.await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            error!("Remote start task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn remote_stop(State(state): State<Arc<AppState>>) -> Response {
    info!("API: Remote stop request");

    let remote = Arc::clone(&state.remote);
    match tokio::task::spawn_blocking(move || remote.stop(None)).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            error!("Remote stop task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/events  → SSE stream of status events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.controller.status_publisher().subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let status_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => encode_event(&event),
            Err(lagged) => {
                // Slow client; later events still arrive
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(status_events, heartbeat_stream());

    // Take events until shutdown signal is received
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn encode_event(event: &StatusEvent) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Ok(Event::default().data(json))),
        Err(e) => {
            tracing::error!("Failed to serialize status event: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&StatusEvent::Heartbeat { timestamp: Utc::now() }) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_builder::ConfigBuilder;
    use crate::controller::{Collaborators, ControllerSettings};
    use crate::status::StatusPublisher;
    use crate::testing::{FakeApps, FakeDns, FakeEngine, FakeEstablisher, FakeGate, FakeProbe, Journal};
    use crate::wake_lock::WakeLock;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use tun_proxy_common::{
        Preferences, RemoteOutcome, StartOutcome, StopOutcome, TunnelStatusResponse,
    };

    fn app() -> (Router, Arc<AppState>) {
        let journal = Journal::default();
        let prefs = Preferences::in_memory();
        let controller = Arc::new(
            TunnelController::new(
                Collaborators {
                    engine: Arc::new(FakeEngine::new(journal.clone(), 1500)),
                    establisher: Arc::new(FakeEstablisher::new(journal)),
                    probe: Arc::new(FakeProbe::with_default("eth0")),
                    config_builder: ConfigBuilder::new(
                        prefs.clone(),
                        Arc::new(FakeApps::new(&[])),
                        Arc::new(FakeDns(vec![])),
                    ),
                    preferences: prefs.clone(),
                    status: StatusPublisher::new(),
                    wake_lock: WakeLock::noop(),
                },
                ControllerSettings::default(),
            )
            .unwrap(),
        );
        let remote = Arc::new(RemoteService::new(
            Arc::clone(&controller),
            prefs,
            Arc::new(FakeGate::granted()),
        ));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let state = Arc::new(AppState {
            controller,
            remote,
            shutdown_tx,
        });
        (create_router(Arc::clone(&state)), state)
    }

    async fn call<T: serde::de::DeserializeOwned>(app: &Router, method: &str, uri: &str, body: Option<String>) -> (StatusCode, T) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With test interval override, we should see a heartbeat well within 1s.
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        // Ensure we emitted a heartbeat payload
        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_endpoint() {
        let (app, _state) = app();
        let (code, status): (_, TunnelStatusResponse) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert!(!status.running);
        assert_eq!(status.interface, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_without_proxy_is_idle() {
        let (app, state) = app();
        let (code, outcome): (_, StartOutcome) = call(&app, "POST", "/api/tunnel/start", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(outcome, StartOutcome::Idle);
        assert!(state.controller.is_running());

        let (_, outcome): (_, StopOutcome) = call(&app, "POST", "/api/tunnel/stop", None).await;
        assert_eq!(outcome, StopOutcome::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_start_and_stop() {
        let (app, state) = app();
        let body = r#"{"host":"127.0.0.1","port":1080,"apps":["curl"]}"#.to_string();
        let (code, outcome): (_, RemoteOutcome) =
            call(&app, "POST", "/api/remote/start-allowed", Some(body)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(outcome, RemoteOutcome::Success);
        assert!(state.controller.status().started_remotely);

        let (_, outcome): (_, RemoteOutcome) = call(&app, "POST", "/api/remote/stop", None).await;
        assert_eq!(outcome, RemoteOutcome::Success);
        assert!(!state.controller.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_start_rejects_hostname() {
        let (app, _state) = app();
        let body = r#"{"host":"proxy.example.com","port":1080}"#.to_string();
        let (_, outcome): (_, RemoteOutcome) =
            call(&app, "POST", "/api/remote/start-denied", Some(body)).await;
        assert!(matches!(outcome, RemoteOutcome::Failed { .. }));
    }
}
