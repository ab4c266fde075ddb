//! `BrokerServer`: axum HTTP + WebSocket surface of the broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{AuthGate, DeviceDirectory, credential_from_request};
use crate::config::BrokerConfig;
use crate::health::{self, HealthResponse, StatusResponse};
use crate::metrics::WS_AUTH_FAILURES_TOTAL;
use crate::routing::MessageRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::sink::{EventSink, NoopEventSink};
use crate::websocket::{Hub, Session, run_session};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Channel map.
    pub hub: Hub,
    /// Inbound frame router.
    pub router: Arc<MessageRouter>,
    /// Upgrade authorization.
    pub gate: Arc<AuthGate>,
    /// Runtime configuration.
    pub config: Arc<BrokerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The broker server.
pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    hub: Hub,
    sink: Arc<dyn EventSink>,
    directory: Option<Arc<dyn DeviceDirectory>>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl BrokerServer {
    /// Create a server with a no-op event sink and an open device directory.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            hub: Hub::new(),
            sink: Arc::new(NoopEventSink),
            directory: None,
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Record accepted heartbeats and action logs in `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Refuse device tokens for agents `directory` does not know.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let mut gate = AuthGate::new(&self.config.jwt_secret);
        if let Some(directory) = &self.directory {
            gate = gate.with_directory(Arc::clone(directory));
        }
        let router = MessageRouter::new(
            self.hub.clone(),
            Arc::clone(&self.sink),
            self.config.pending_request_ttl,
        );

        let state = AppState {
            hub: self.hub.clone(),
            router: Arc::new(router),
            gate: Arc::new(gate),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/ws/status", get(status_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, start serving and start the stale sweep.
    ///
    /// Both stop when the shutdown coordinator fires. The returned handle
    /// completes once the listener has drained.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let sweep = self
            .hub
            .spawn_stale_sweep(self.config.stale_timeout, token.clone());

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "server exited with error");
            }
            let _ = sweep.await;
        });

        info!(%addr, "broker listening");
        Ok((addr, handle))
    }

    /// The channel map.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

/// Upgrade query string.
#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// GET /ws
///
/// The credential is checked before the upgrade itself, so a refused client
/// gets `401` whether or not its request was a valid upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let credential = credential_from_request(query.token.as_deref(), &headers);
    let identity = match state.gate.authorize(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(err) => {
            counter!(WS_AUTH_FAILURES_TOTAL, "code" => err.code()).increment(1);
            return err.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let (session, queue) = Session::new(identity, state.config.send_queue_capacity);
    let hub = state.hub.clone();
    let router = Arc::clone(&state.router);
    let timing = state.config.timing;
    let shutdown = state.shutdown.token().child_token();

    upgrade
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_session(socket, session, queue, hub, router, timing, shutdown)
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.session_count(),
        state.hub.channels().len(),
    ))
}

/// GET /ws/status
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::from(state.hub.status()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::auth::StaticDirectory;

    const SECRET: &str = "test-secret";

    fn make_server() -> BrokerServer {
        BrokerServer::new(BrokerConfig {
            jwt_secret: SECRET.into(),
            ..BrokerConfig::default()
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert_eq!(server.hub().session_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_json(make_server().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["channels"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn status_endpoint_reports_channels() {
        let server = make_server();
        let (session, _rx) = crate::websocket::session::tests::admin("7", 4);
        assert!(server.hub().register(session));

        let (status, body) = get_json(server.router(), "/ws/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["total_channels"], 1);
        assert_eq!(body["channels"]["admin::dashboard"], 1);
    }

    #[tokio::test]
    async fn upgrade_without_token_is_unauthorized() {
        let (status, body) = get_json(make_server().router(), "/ws").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "missing_credential");
    }

    #[tokio::test]
    async fn upgrade_with_bad_jwt_is_unauthorized() {
        let (status, body) = get_json(make_server().router(), "/ws?token=not-a-jwt").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "invalid_token");
    }

    #[tokio::test]
    async fn unknown_device_is_unauthorized() {
        let server = make_server().with_directory(Arc::new(StaticDirectory::new(["known"])));
        let (status, body) = get_json(server.router(), "/ws?token=device_stranger").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "unknown_device");
    }

    #[tokio::test]
    async fn authorized_plain_get_is_not_upgraded() {
        let req = Request::builder()
            .uri("/ws?token=device_lab-01")
            .body(Body::empty())
            .unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders_text() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = make_server().with_metrics(handle);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
