//! HTTP + WebSocket front end for a running engine.
//!
//!   GET  /state                  engine state and wallet address
//!   POST /initialize             (re)run engine initialization
//!   GET  /forms?role=            held forms, newest first
//!   GET  /forms/{id}             one form
//!   POST /forms                  create and publish a form from a draft
//!   POST /forms/{id}/responses   answer a form
//!   POST /forms/{id}/view        set the form under view
//!   POST /forms/{id}/grant       keep an open form when it arrives
//!   GET  /ws/events              WebSocket stream of engine events
//!
//! Forms are served without their private sealing key. Cross-origin reads
//! are allowed only for the configured origins.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use whisperbox_protocol::form::{Answer, Form, FormDraft, Response as FormResponse};

use crate::{
    error::EngineError,
    events::{EngineEvent, EngineState},
    handle::EngineHandle,
    repository::Role,
};

/// Forms returned by one list call.
const FORM_LIST_LIMIT: usize = 100;
const EVENT_FANOUT: usize = 512;

// ============================================================================
// Shared API state
// ============================================================================

struct ApiInner {
    handle:   EngineHandle,
    address:  String,
    event_tx: broadcast::Sender<EngineEvent>,
}

/// Cheaply cloneable shared state passed to all axum handlers.
#[derive(Clone)]
pub struct ApiState(Arc<ApiInner>);

impl ApiState {
    pub fn new(handle: EngineHandle, address: String) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_FANOUT);
        Self(Arc::new(ApiInner { handle, address, event_tx }))
    }

    /// Broadcast an event to all /ws/events subscribers.
    pub fn send_event(&self, event: EngineEvent) {
        let _ = self.0.event_tx.send(event);
    }

    /// Pump engine events into the WebSocket fan-out until the engine stops.
    pub async fn forward_events(self, mut rx: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            self.send_event(event);
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_) | EngineError::Signature(_) => StatusCode::BAD_REQUEST,
        EngineError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        EngineError::Duplicate(_) => StatusCode::CONFLICT,
        EngineError::FormNotFound(_) | EngineError::KeyNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NotReady(_) | EngineError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Decryption | EngineError::Transport(_) | EngineError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Only exact origins are accepted; `*` is refused.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) if value != "*" => Some(value),
            _ => {
                tracing::warn!("Ignoring CORS origin {origin:?}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::list(allowed))
}

pub fn router(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/state",                get(get_state))
        .route("/initialize",           post(initialize))
        .route("/forms",                get(list_forms).post(create_form))
        .route("/forms/{id}",           get(get_form))
        .route("/forms/{id}/responses", post(submit_response))
        .route("/forms/{id}/view",      post(view_form))
        .route("/forms/{id}/grant",     post(grant_access))
        .route("/ws/events",            get(ws_events_handler))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr, cors_origins: &[String]) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API listening on http://{addr}");
    axum::serve(listener, router(state, cors_origins)).await?;
    Ok(())
}

// ============================================================================
// Route handlers
// ============================================================================

#[derive(Serialize)]
struct StateView {
    state:   EngineState,
    address: String,
}

async fn get_state(State(state): State<ApiState>) -> Result<Json<StateView>, ApiError> {
    let engine_state = state.0.handle.state().await?;
    Ok(Json(StateView { state: engine_state, address: state.0.address.clone() }))
}

async fn initialize(State(state): State<ApiState>) -> Result<Json<StateView>, ApiError> {
    state.0.handle.initialize().await?;
    get_state(State(state)).await
}

#[derive(Deserialize)]
struct FormsQuery {
    role: Option<Role>,
}

async fn list_forms(
    State(state): State<ApiState>,
    Query(query): Query<FormsQuery>,
) -> Result<Json<Vec<Form>>, ApiError> {
    let mut forms = state.0.handle.forms(query.role).await?;
    forms.truncate(FORM_LIST_LIMIT);
    Ok(Json(forms))
}

async fn get_form(
    Path(id):     Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<Form>, ApiError> {
    match state.0.handle.form(&id).await? {
        Some(form) => Ok(Json(form.for_publication())),
        None => Err(EngineError::FormNotFound(id).into()),
    }
}

async fn create_form(
    State(state): State<ApiState>,
    Json(draft):  Json<FormDraft>,
) -> Result<(StatusCode, Json<Form>), ApiError> {
    let form = state.0.handle.create_form(draft).await?;
    Ok((StatusCode::CREATED, Json(form.for_publication())))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    answers:      Vec<Answer>,
    #[serde(default)]
    display_name: Option<String>,
}

async fn submit_response(
    Path(id):     Path<String>,
    State(state): State<ApiState>,
    Json(req):    Json<SubmitRequest>,
) -> Result<(StatusCode, Json<FormResponse>), ApiError> {
    let response = state.0.handle.submit_response(&id, req.answers, req.display_name).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn view_form(
    Path(id):     Path<String>,
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    state.0.handle.navigate_to(Some(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn grant_access(
    Path(id):     Path<String>,
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    state.0.handle.grant_access(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_events_handler(
    ws:           WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| ws_events_task(socket, state))
}

async fn ws_events_task(mut socket: WebSocket, state: ApiState) {
    let mut rx = state.0.event_tx.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("WS events serialize error: {e}"),
            },
            Err(broadcast::error::RecvError::Closed)    => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("WS events subscriber lagged by {n}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::testing::{evaluator, StaticOracle};
    use crate::engine::{Engine, EngineConfig};
    use crate::identity::{LocalWallet, Wallet};
    use crate::keystore::KeyStore;
    use crate::kv::{KvStore, MemoryKv};
    use crate::repository::FormRepository;
    use crate::transport::{MemoryHub, MemoryTransport};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct Api {
        router: Router,
        state:  ApiState,
        _stop:  watch::Sender<bool>,
    }

    const UI_ORIGIN: &str = "http://localhost:5173";

    async fn api(initialize: bool) -> Api {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let wallet = Arc::new(LocalWallet::generate());
        let address = wallet.address().to_string();
        let config = EngineConfig { min_peers: 0, peer_wait_timeout: None, ..EngineConfig::default() };
        let (engine, handle, events) = Engine::new(
            config,
            Arc::new(MemoryTransport::connect(&hub)),
            wallet,
            FormRepository::open(kv.clone(), evaluator(StaticOracle::default())).unwrap(),
            KeyStore::open(kv).unwrap(),
        );
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));
        if initialize {
            handle.initialize().await.unwrap();
        }
        let state = ApiState::new(handle, address);
        tokio::spawn(state.clone().forward_events(events));
        let origins = vec![UI_ORIGIN.to_string(), "*".to_string()];
        Api { router: router(state.clone(), &origins), state, _stop: stop }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    fn poll_draft() -> Value {
        json!({
            "title": "Poll",
            "questions": [
                { "id": "q1", "kind": "text", "text": "Name?", "required": true }
            ],
            "whitelist": { "mode": "open" }
        })
    }

    #[tokio::test]
    async fn state_reports_ready_and_address() {
        let api = api(true).await;
        let (status, body) = call(&api.router, "GET", "/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "ready");
        assert_eq!(body["address"], api.state.0.address.as_str());
    }

    #[tokio::test]
    async fn create_then_read_forms() {
        let api = api(true).await;
        let (status, created) = call(&api.router, "POST", "/forms", Some(poll_draft())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["privateKey"], "");

        let (status, list) = call(&api.router, "GET", "/forms?role=creator", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["privateKey"], "");

        let (status, one) = call(&api.router, "GET", &format!("/forms/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["id"], created["id"]);
        assert_eq!(one["privateKey"], "");

        let (_, accessible) = call(&api.router, "GET", "/forms?role=accessible", None).await;
        assert!(accessible.as_array().unwrap().is_empty());
    }

    async fn get_with_origin(router: &Router, uri: &str, origin: &str) -> Option<HeaderValue> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).cloned()
    }

    #[tokio::test]
    async fn cross_origin_reads_only_for_configured_origins() {
        let api = api(true).await;
        let (_, created) = call(&api.router, "POST", "/forms", Some(poll_draft())).await;
        let uri = format!("/forms/{}", created["id"].as_str().unwrap());

        assert_eq!(get_with_origin(&api.router, &uri, "https://evil.example").await, None);
        assert_eq!(
            get_with_origin(&api.router, &uri, UI_ORIGIN).await,
            Some(HeaderValue::from_static(UI_ORIGIN))
        );
    }

    #[tokio::test]
    async fn creator_answers_own_form() {
        let api = api(true).await;
        let (_, created) = call(&api.router, "POST", "/forms", Some(poll_draft())).await;
        let id = created["id"].as_str().unwrap();

        let answer = json!({ "answers": [{ "questionId": "q1", "value": "Rae" }], "displayName": "Rae" });
        let uri = format!("/forms/{id}/responses");
        let (status, response) = call(&api.router, "POST", &uri, Some(answer.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(response["respondentDisplayName"], "Rae");

        let (status, body) = call(&api.router, "POST", &uri, Some(answer)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("duplicate"));
    }

    #[tokio::test]
    async fn error_statuses() {
        let api = api(true).await;
        let bad = json!({ "title": "", "questions": [] });
        assert_eq!(call(&api.router, "POST", "/forms", Some(bad)).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&api.router, "GET", "/forms/abc", None).await.0, StatusCode::NOT_FOUND);

        let answer = json!({ "answers": [] });
        let (status, _) = call(&api.router, "POST", "/forms/abc/responses", Some(answer)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(call(&api.router, "GET", "/forms?role=owner", None).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&api.router, "POST", "/forms/abc/view", None).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&api.router, "POST", "/forms/abc/grant", None).await.0, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn uninitialized_engine_is_unavailable() {
        let api = api(false).await;
        let (status, _) = call(&api.router, "POST", "/forms", Some(poll_draft())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (_, body) = call(&api.router, "GET", "/state", None).await;
        assert_eq!(body["state"], "uninitialized");

        let (status, body) = call(&api.router, "POST", "/initialize", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "ready");
        let (status, _) = call(&api.router, "POST", "/forms", Some(poll_draft())).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn engine_events_reach_subscribers() {
        let api = api(false).await;
        let mut rx = api.state.0.event_tx.subscribe();
        api.state.0.handle.initialize().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::StateChanged { state: EngineState::Initializing }));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&EngineError::Signature("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&EngineError::AccessDenied { form_id: "f".into(), address: "a".into() }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&EngineError::KeyNotFound("f".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&EngineError::Shutdown), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&EngineError::Decryption), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
