//! HTTP application wiring.
//!
//! A node serves one JSON-RPC endpoint at `POST /` (answering JSON or
//! SSE depending on the method), the public agent card, a health
//! endpoint, and the authenticated extended card. Bearer authentication
//! gates every endpoint except the card and health.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::lifecycle::TaskManager;
use super::push::PushConfigStore;
use super::queue::QueueManager;
use super::store::TaskStore;
use crate::checkpoint::CheckpointStore;
use crate::config::NodeConfig;
use crate::error::{JsonRpcError, Result};
use crate::types::{AgentCard, JsonRpcErrorResponse};
use crate::worker::{Worker, WorkerHost};

/// Well-known path where the public agent card is served.
pub const WELL_KNOWN_CARD_PATH: &str = "/.well-known/agent.json";

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    extended_card: Option<Arc<AgentCard>>,
    auth: Arc<crate::config::AuthConfig>,
    started_at: Instant,
}

/// A fully wired agent node.
///
/// Owns the runtime components and the axum router serving them.
pub struct AgentNode {
    router: Router,
    config: NodeConfig,
    host: Arc<WorkerHost>,
    checkpoints: Arc<CheckpointStore>,
    flusher: tokio::task::JoinHandle<()>,
}

impl AgentNode {
    /// Builds a node from configuration, a worker, and its public card.
    pub fn new(config: NodeConfig, worker: Arc<dyn Worker>, card: AgentCard) -> Self {
        Self::with_checkpoint_store(
            config.clone(),
            worker,
            card,
            Arc::new(CheckpointStore::new(
                Arc::new(crate::checkpoint::MemoryBackend::new()),
                config.retention.clone(),
            )),
        )
    }

    /// Builds a node over an externally provided checkpoint store
    /// (`checkpoint.backend = external`).
    pub fn with_checkpoint_store(
        config: NodeConfig,
        worker: Arc<dyn Worker>,
        card: AgentCard,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let store = Arc::new(TaskStore::new());
        let queues = Arc::new(QueueManager::new(config.queue.capacity_per_task));
        let sync =
            crate::checkpoint::build_synchronizer(Arc::clone(&checkpoints), &config.checkpoint);
        let flusher = sync.spawn_flusher();

        let manager = Arc::new(TaskManager::new(store, queues, sync));
        let host = Arc::new(WorkerHost::new(
            worker,
            Arc::clone(&manager),
            Arc::clone(&checkpoints),
            config.worker.clone(),
        ));
        let card = Arc::new(card);
        let dispatcher = Arc::new(Dispatcher::new(
            manager,
            Arc::clone(&host),
            Arc::new(PushConfigStore::new()),
            Arc::clone(&card),
        ));

        let state = AppState {
            dispatcher,
            extended_card: Some(Arc::clone(&card)),
            auth: Arc::new(config.auth.clone()),
            started_at: Instant::now(),
        };
        let router = build_router(state);

        Self {
            router,
            config,
            host,
            checkpoints,
            flusher,
        }
    }

    /// The axum router, for embedding or in-process testing.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// The worker host, for direct task control in embedding code.
    #[must_use]
    pub fn worker_host(&self) -> &Arc<WorkerHost> {
        &self.host
    }

    /// The checkpoint store backing this node.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Rehydrates non-terminal tasks from checkpoints and resumes their
    /// workers. Subscribers from before the restart must resubscribe.
    ///
    /// A task whose worker cannot be restarted is failed with a
    /// `worker unrecoverable` cause.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.checkpoints.recover_active().await?;
        let mut resumed = 0;
        for entry in recovered {
            let task_id = entry.task.id.clone();
            let waiting = entry.task.is_waiting();
            let last_user = entry.task.last_user_message().cloned();
            self.host.manager().rehydrate(entry.task).await?;

            // Paused tasks wait for the caller; only running ones restart.
            if waiting {
                continue;
            }
            let Some(message) = last_user else {
                self.host
                    .manager()
                    .fail(&task_id, "worker unrecoverable")
                    .await?;
                continue;
            };
            match self
                .host
                .spawn_start(&task_id, message, entry.worker_state)
                .await
            {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Worker rehydration failed");
                    self.host
                        .manager()
                        .fail(&task_id, "worker unrecoverable")
                        .await?;
                }
            }
        }
        info!(resumed, "Recovery complete");
        Ok(resumed)
    }

    /// Binds and serves until the process is stopped.
    pub async fn serve(self) -> std::io::Result<()> {
        let addr = self.config.server.bind_address();
        info!(%addr, "Agent node listening");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router.clone()).await
    }

    /// Binds and serves until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.server.bind_address();
        info!(%addr, "Agent node listening (graceful shutdown armed)");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

impl Drop for AgentNode {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

impl std::fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentNode")
            .field("bind", &self.config.server.bind_address())
            .finish_non_exhaustive()
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/", post(handle_rpc))
        .route(WELL_KNOWN_CARD_PATH, get(handle_card))
        .route("/health", get(handle_health))
        .route("/agent/authenticatedExtendedCard", get(handle_extended_card))
        .layer(cors)
        .with_state(state)
}

/// Checks the `Authorization` header against configured tokens.
fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    if !state.auth.required() {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if state.auth.accepts(token) => Ok(()),
        _ => {
            let body = JsonRpcErrorResponse::new(None, JsonRpcError::authentication_required());
            let payload = serde_json::to_string(&body).unwrap_or_default();
            Err((
                StatusCode::UNAUTHORIZED,
                [(header::CONTENT_TYPE, "application/json")],
                payload,
            )
                .into_response())
        }
    }
}

async fn handle_rpc(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match state.dispatcher.dispatch(&body, last_event_id).await {
        DispatchOutcome::Json(json) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        DispatchOutcome::Stream(sse) => sse.into_response(),
    }
}

async fn handle_card(State(state): State<AppState>) -> Json<AgentCard> {
    Json(state.dispatcher.card().as_ref().clone())
}

async fn handle_extended_card(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match &state.extended_card {
        Some(card) => Json(card.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tasks_active = state.dispatcher.active_tasks().await;
    Json(serde_json::json!({
        "status": "ok",
        "tasks_active": tasks_active,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
