//! HTTP API: run handlers, real-time endpoints, and the web server.

use anyhow::Result;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{stream::Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, TransportUpgradeError};
use crate::events::DomainEvent;
use crate::hub::Hub;
use crate::models::{ApiResponse, NewRun, RunWithUser, UpdateRunUser, User};
use crate::notifier::{ChannelTransport, Subscriber, WebSocketTransport};
use crate::storage::Storage;

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub hub: Hub,
    pub config: Arc<Config>,
    /// Flips to `true` when the server is shutting down
    pub shutdown: watch::Receiver<bool>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(storage: Storage, hub: Hub, config: Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            storage,
            hub,
            config: Arc::new(config),
            shutdown,
            started_at: Utc::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database_ok: bool,
    pub subscribers: usize,
    pub uptime_seconds: i64,
}

/// Query parameters for user search.
#[derive(Debug, Deserialize)]
pub struct UserSearchQuery {
    #[serde(default)]
    name: String,
    limit: Option<String>,
}

const DEFAULT_SEARCH_LIMIT: i64 = 10;

/// Run the web server until Ctrl-C.
pub async fn run_web_server(config: Config, storage: Storage) -> Result<()> {
    let (hub, dispatcher) = Hub::start();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.host, config.http_port).parse()?;
    let state = AppState::new(storage, hub, config, shutdown_rx);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down gracefully...");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // The dispatch loop stops once every connection has released the hub.
    if tokio::time::timeout(Duration::from_secs(5), dispatcher)
        .await
        .is_err()
    {
        warn!("Dispatch loop did not stop within 5s");
    }

    Ok(())
}

/// Build the router with all routes and layers.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Runs
        .route("/api/v2/runs", get(list_runs_handler).post(create_run_handler))
        .route("/api/v2/runs/:id/user", put(update_run_user_handler))
        .route("/api/v2/runs/:id", delete(delete_run_handler))
        // Real-time
        .route("/api/v2/runs/ws", get(websocket_handler))
        .route("/api/v2/runs/sse", get(sse_handler).post(sse_handler))
        // Images and users
        .route("/api/v2/images", post(upload_image_handler))
        .route("/api/v2/users/search", get(search_users_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Publish after a successful mutation. The mutation already happened, so a
/// closed queue is only logged.
fn notify(hub: &Hub, event: DomainEvent) {
    let kind = event.kind;
    if let Err(e) = hub.publish(event) {
        warn!("Failed to publish {}: {}", kind, e);
    }
}

fn parse_run_id(id: &str) -> Result<(), ApiError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| ApiError::bad_request("Invalid run ID format"))
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_ok = state.storage.ping().await;

    Json(HealthResponse {
        status: if database_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database_ok,
        subscribers: state.hub.subscriber_count().await,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Prometheus text exposition of hub activity.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    let uptime = (Utc::now() - state.started_at).num_seconds();

    let body = format!(
        "# HELP trichter_subscribers Registered real-time subscribers.\n\
         # TYPE trichter_subscribers gauge\n\
         trichter_subscribers {}\n\
         # HELP trichter_events_published_total Events accepted by the hub.\n\
         # TYPE trichter_events_published_total counter\n\
         trichter_events_published_total {}\n\
         # HELP trichter_deliveries_failed_total Event writes that failed.\n\
         # TYPE trichter_deliveries_failed_total counter\n\
         trichter_deliveries_failed_total {}\n\
         # HELP trichter_uptime_seconds Seconds since the server started.\n\
         # TYPE trichter_uptime_seconds gauge\n\
         trichter_uptime_seconds {}\n",
        stats.subscribers, stats.events_published, stats.deliveries_failed, uptime
    );

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// List all runs with their users.
async fn list_runs_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<RunWithUser>>, ApiError> {
    Ok(Json(state.storage.list_runs_with_users().await?))
}

/// Create a run and announce it.
async fn create_run_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewRun>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(new_run) = payload.map_err(|e| ApiError::BadRequest {
        message: "Validation failed".to_string(),
        details: Some(e.body_text()),
    })?;

    let image = new_run
        .image
        .as_deref()
        .filter(|image| !image.is_empty())
        .unwrap_or(&state.config.placeholder_image);
    let user_id = new_run.user_id.as_deref().filter(|id| !id.is_empty());

    let run = state.storage.save_run(user_id, new_run.data(), image).await?;
    info!("Created new run: {}", run.id);

    notify(&state.hub, DomainEvent::run_created(&run.id));
    Ok(Json(ApiResponse::ok()))
}

/// Link a run to a user and announce the change.
async fn update_run_user_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    payload: Result<Json<UpdateRunUser>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest {
        message: "Invalid request body".to_string(),
        details: Some(e.body_text()),
    })?;
    parse_run_id(&run_id)?;

    if !state.storage.update_run_user(&run_id, &request.user_id).await? {
        return Err(ApiError::NotFound("Run not found".to_string()));
    }
    info!("Updated run {} with user {}", run_id, request.user_id);

    notify(&state.hub, DomainEvent::run_updated(&run_id));
    Ok(Json(ApiResponse::ok()))
}

/// Delete a run and announce it.
async fn delete_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    parse_run_id(&run_id)?;

    if !state.storage.delete_run(&run_id).await? {
        return Err(ApiError::NotFound("Run not found".to_string()));
    }
    info!("Deleted run: {}", run_id);

    notify(&state.hub, DomainEvent::run_deleted(&run_id));
    Ok(Json(ApiResponse::ok()))
}

/// Image upload placeholder: accepts any image and hands back a resource path.
async fn upload_image_handler(headers: HeaderMap) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("image/") {
        return Err(ApiError::UnsupportedMediaType);
    }

    let path = format!("trichter-images/uploaded-{}.jpg", Utc::now().timestamp());
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        Ok(Json(serde_json::json!({ "resource": path })).into_response())
    } else {
        Ok(path.into_response())
    }
}

/// Search users by name.
async fn search_users_handler(
    State(state): State<AppState>,
    Query(query): Query<UserSearchQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let limit = match query.limit.as_deref() {
        None => DEFAULT_SEARCH_LIMIT,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .and_then(|limit| i64::try_from(limit).ok())
            .ok_or_else(|| ApiError::bad_request("Invalid limit parameter"))?,
    };

    Ok(Json(state.storage.search_users(&query.name, limit).await?))
}

/// Resolves when shutdown is requested. Never resolves if the signal
/// sender is gone without having fired.
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// WebSocket upgrade handler.
async fn websocket_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("{}", TransportUpgradeError(rejection.body_text()));
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(|e: axum::Error| warn!("{}", TransportUpgradeError(e.to_string())))
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Own one WebSocket subscriber for the lifetime of its connection.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let transport = WebSocketTransport::new(sink, state.config.ws_write_timeout());
    let subscriber = Subscriber::connect(&state.hub, transport).await;
    info!(subscriber = %subscriber.id(), "WebSocket client connected");

    let shutdown = shutdown_requested(state.shutdown.clone());
    tokio::pin!(shutdown);

    // Clients only listen; reading detects disconnects, a failed write
    // detects peers that stopped reading.
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(subscriber = %subscriber.id(), "WebSocket read error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = subscriber.transport_failed() => {
                debug!(subscriber = %subscriber.id(), "WebSocket write failed, dropping client");
                break;
            }
            _ = &mut shutdown => break,
        }
    }

    subscriber.close().await;
    info!(subscriber = %subscriber.id(), "WebSocket client disconnected");
}

/// Server-Sent Events stream of run events.
async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (transport, rx) = ChannelTransport::channel();
    let subscriber = Subscriber::connect(&state.hub, transport).await;
    info!(subscriber = %subscriber.id(), "SSE client connected");

    // Dropped together with the stream when the client goes away.
    let guard = subscriber.close_on_drop();

    let stream = UnboundedReceiverStream::new(rx)
        .map(move |frame| {
            let _guard = &guard;
            Ok::<_, Infallible>(Event::default().event(frame.kind.as_str()).data(frame.text))
        })
        .take_until(shutdown_requested(state.shutdown.clone()));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.sse_keep_alive())
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::hub::tests::Recorder;
    use crate::models::RunData;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    async fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("api.db")).await.unwrap();
        storage.initialize().await.unwrap();

        let (hub, _dispatcher) = Hub::start();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut config = Config::default();
        config.cors_origins = vec![];

        TestApp {
            state: AppState::new(storage, hub, config, shutdown_rx),
            shutdown_tx,
            _dir: dir,
        }
    }

    async fn listen(app: &TestApp) -> (Arc<Recorder>, mpsc::UnboundedReceiver<DomainEvent>) {
        let (recorder, rx) = Recorder::new();
        app.state.hub.register(recorder.clone()).await;
        (recorder, rx)
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = create_router(app.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into()));
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DomainEvent>) -> DomainEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("recorder closed")
    }

    async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<DomainEvent>) {
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    async fn seed_run(app: &TestApp) -> String {
        let data = RunData {
            duration: 1.0,
            rate: 2.0,
            volume: 3.0,
        };
        app.state
            .storage
            .save_run(None, data, "seed.jpg")
            .await
            .unwrap()
            .id
    }

    async fn wait_for_subscribers(hub: &Hub, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while hub.subscriber_count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("subscriber count never reached {}", expected));
    }

    #[tokio::test]
    async fn test_create_run_publishes_once() {
        let app = test_app().await;
        let (_recorder, mut rx) = listen(&app).await;

        let (status, body) = send(
            &app,
            json_request("POST", "/api/v2/runs", r#"{"duration":1.5,"rate":0.8,"volume":0.5}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let runs = app.state.storage.list_runs_with_users().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].image, crate::models::PLACEHOLDER_IMAGE);

        let event = next_event(&mut rx).await;
        assert_eq!(event, DomainEvent::run_created(&runs[0].id));
        assert_no_event(&mut rx).await;
    }

    #[tokio::test]
    async fn test_create_run_rejects_malformed_body() {
        let app = test_app().await;
        let (_recorder, mut rx) = listen(&app).await;

        let (status, body) =
            send(&app, json_request("POST", "/api/v2/runs", r#"{"duration":"fast"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Validation failed");
        assert!(body["details"].is_string());
        assert_no_event(&mut rx).await;
    }

    #[tokio::test]
    async fn test_update_run_user() {
        let app = test_app().await;
        app.state
            .storage
            .insert_user(&User {
                id: "u1".into(),
                name: "Alice".into(),
                username: "alice".into(),
                display_username: None,
            })
            .await
            .unwrap();
        let run_id = seed_run(&app).await;
        let (_recorder, mut rx) = listen(&app).await;

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/v2/runs/not-a-uuid/user", r#"{"userId":"u1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = format!("/api/v2/runs/{}/user", Uuid::new_v4());
        let (status, _) = send(&app, json_request("PUT", &missing, r#"{"userId":"u1"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_no_event(&mut rx).await;

        let uri = format!("/api/v2/runs/{}/user", run_id);
        let (status, _) = send(&app, json_request("PUT", &uri, r#"{"userId":"u1"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(next_event(&mut rx).await, DomainEvent::run_updated(&run_id));

        let (status, runs) = send(&app, empty_request("GET", "/api/v2/runs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs[0]["user"]["username"], "alice");
    }

    #[tokio::test]
    async fn test_delete_run() {
        let app = test_app().await;
        let run_id = seed_run(&app).await;
        let (_recorder, mut rx) = listen(&app).await;
        let uri = format!("/api/v2/runs/{}", run_id);

        let (status, _) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(next_event(&mut rx).await, DomainEvent::run_deleted(&run_id));

        let (status, body) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Run not found");
        assert_no_event(&mut rx).await;
    }

    #[tokio::test]
    async fn test_upload_image_placeholder() {
        let app = test_app().await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/images")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/images")
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::ACCEPT, "application/json")
            .body(Body::from(vec![0u8; 16]))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let resource = body["resource"].as_str().unwrap();
        assert!(resource.starts_with("trichter-images/uploaded-"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/images")
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_search_users() {
        let app = test_app().await;
        app.state
            .storage
            .insert_user(&User {
                id: "u1".into(),
                name: "Alice".into(),
                username: "alice".into(),
                display_username: Some("Ali".into()),
            })
            .await
            .unwrap();

        let (status, _) = send(&app, empty_request("GET", "/api/v2/users/search?name=a&limit=x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Past i64::MAX; must not wrap into an unlimited query.
        let (status, body) = send(
            &app,
            empty_request("GET", "/api/v2/users/search?name=a&limit=18446744073709551615"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid limit parameter");

        let (status, body) = send(&app, empty_request("GET", "/api/v2/users/search?name=a&limit=0")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        let (status, body) = send(&app, empty_request("GET", "/api/v2/users/search?name=ALI")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["displayUsername"], "Ali");
    }

    #[tokio::test]
    async fn test_health_reports_subscribers() {
        let app = test_app().await;
        let (_recorder, _rx) = listen(&app).await;

        let (status, body) = send(&app, empty_request("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["subscribers"], 1);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = test_app().await;
        let (_recorder, mut rx) = listen(&app).await;

        let (status, _) = send(
            &app,
            json_request("POST", "/api/v2/runs", r#"{"duration":1.0,"rate":1.0,"volume":1.0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        next_event(&mut rx).await;

        let response = create_router(app.state.clone())
            .oneshot(empty_request("GET", "/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE trichter_events_published_total counter"));
        assert!(text.lines().any(|l| l == "trichter_subscribers 1"));
        assert!(text.lines().any(|l| l == "trichter_events_published_total 1"));
        assert!(text.lines().any(|l| l == "trichter_deliveries_failed_total 0"));
    }

    #[tokio::test]
    async fn test_websocket_requires_upgrade() {
        let app = test_app().await;

        let (status, _) = send(&app, empty_request("GET", "/api/v2/runs/ws")).await;
        assert!(status.is_client_error());
        assert_eq!(app.state.hub.subscriber_count().await, 0);
    }

    async fn spawn_server(app: &TestApp) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(app.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_websocket_end_to_end() {
        let app = test_app().await;
        let addr = spawn_server(&app).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v2/runs/ws", addr))
            .await
            .unwrap();
        wait_for_subscribers(&app.state.hub, 1).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/api/v2/runs", addr))
            .json(&serde_json::json!({ "duration": 3.0, "rate": 1.0, "volume": 3.0 }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame received")
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(frame["event"], EventKind::RunCreated.as_str());

        let runs = app.state.storage.list_runs_with_users().await.unwrap();
        assert_eq!(frame["data"]["id"], runs[0].id.as_str());

        ws.close(None).await.unwrap();
        wait_for_subscribers(&app.state.hub, 0).await;
    }

    #[tokio::test]
    async fn test_websocket_closed_on_shutdown() {
        let app = test_app().await;
        let addr = spawn_server(&app).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v2/runs/ws", addr))
            .await
            .unwrap();
        wait_for_subscribers(&app.state.hub, 1).await;

        app.shutdown_tx.send(true).unwrap();
        wait_for_subscribers(&app.state.hub, 0).await;

        // The server side closed the socket.
        let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        assert!(!matches!(
            next,
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stalled_websocket_client_is_dropped() {
        let mut app = test_app().await;
        let mut config = (*app.state.config).clone();
        config.ws_write_timeout_secs = 1;
        app.state.config = Arc::new(config);
        let addr = spawn_server(&app).await;

        // Connected, but never polled again: socket buffers fill up.
        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v2/runs/ws", addr))
            .await
            .unwrap();
        wait_for_subscribers(&app.state.hub, 1).await;

        let big_id = "x".repeat(64 * 1024);
        timeout(Duration::from_secs(20), async {
            while app.state.hub.subscriber_count().await > 0 {
                for _ in 0..50 {
                    let _ = app.state.hub.publish(DomainEvent::run_created(&big_id));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("stalled subscriber still registered");

        assert!(app.state.hub.stats().await.deliveries_failed >= 1);
    }

    #[tokio::test]
    async fn test_sse_end_to_end() {
        let app = test_app().await;
        let addr = spawn_server(&app).await;

        let mut response = reqwest::get(format!("http://{}/api/v2/runs/sse", addr))
            .await
            .unwrap();
        assert!(response.status().is_success());
        wait_for_subscribers(&app.state.hub, 1).await;

        app.state.hub.publish(DomainEvent::run_deleted("gone")).unwrap();

        let mut received = String::new();
        timeout(Duration::from_secs(2), async {
            while !received.contains("\n\n") {
                let chunk = response.chunk().await.unwrap().expect("stream ended");
                received.push_str(&String::from_utf8_lossy(&chunk));
            }
        })
        .await
        .expect("no SSE event received");

        assert!(received.contains("event: run-deleted"));
        assert!(received.contains(r#"data: {"event":"run-deleted","data":{"id":"gone"}}"#));

        // The server notices the disconnect at the latest on its next write.
        drop(response);
        timeout(Duration::from_secs(5), async {
            while app.state.hub.subscriber_count().await > 0 {
                let _ = app.state.hub.publish(DomainEvent::run_updated("poke"));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("SSE subscriber was not released");
    }
}
