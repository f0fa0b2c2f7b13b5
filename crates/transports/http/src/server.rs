//! HTTP server implementation for the worker-facing queue protocol
//!
//! Endpoints:
//! - GET  /v1/queue/:queueName - long-poll for work
//! - POST /v1/queue/:reqid - post a result
//! - POST /v1/queue/updatemodulestatus/:moduleId - report module status
//! - GET  /v1/status/modules - process status snapshots
//! - GET  /health - health check

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use modserve_core::payload::ModuleResponse;
use modserve_core::{Error as CoreError, ModuleSupervisor, ProcessStatus, QueueBroker, ServerConfig};

use crate::error::{Error, Result};

/// HTTP server state shared across handlers
#[derive(Clone)]
pub struct ServerState {
    /// Request queue broker
    broker: Arc<QueueBroker>,
    /// Module process supervisor
    supervisor: ModuleSupervisor,
    /// Server configuration
    config: Arc<ServerConfig>,
    /// Cancelled when the server shuts down; unparks in-flight long-polls
    shutdown: CancellationToken,
}

impl ServerState {
    /// Creates the shared handler state.
    pub fn new(
        config: Arc<ServerConfig>,
        broker: Arc<QueueBroker>,
        supervisor: ModuleSupervisor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            supervisor,
            config,
            shutdown,
        }
    }
}

/// HTTP server for the worker-facing queue protocol
pub struct HttpServer {
    bind_address: String,
    state: ServerState,
}

impl HttpServer {
    /// Creates a new HTTP server over the broker and supervisor.
    pub fn new(
        config: Arc<ServerConfig>,
        broker: Arc<QueueBroker>,
        supervisor: ModuleSupervisor,
        shutdown: CancellationToken,
    ) -> Self {
        let bind_address = config.bind_address.clone();
        let state = ServerState::new(config, broker, supervisor, shutdown);
        Self {
            bind_address,
            state,
        }
    }

    /// Builds the router with all endpoints.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Starts the HTTP server.
    ///
    /// Blocks until the shutdown token fires and in-flight connections
    /// drain.
    pub async fn serve(self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::Server(format!("Invalid bind address: {e}")))?;

        tracing::info!("Starting HTTP server on {addr}");

        let shutdown = self.state.shutdown.clone();
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind: {e}")))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::Server(format!("Server error: {e}")))?;

        Ok(())
    }
}

/// Builds the protocol router over a prepared state; exposed for tests.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/status/modules", get(module_statuses_handler))
        .route(
            "/v1/queue/updatemodulestatus/:module_id",
            post(update_module_status_handler),
        )
        .route(
            "/v1/queue/:name",
            get(get_queue_handler).post(set_response_handler),
        )
        .with_state(state)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

/// Map broker errors to HTTP status codes and `{success, error, code}`
/// bodies; the same shape front-end callers receive.
fn map_broker_error(e: &CoreError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ModuleResponse::from(e).to_value()))
}

/// Health check endpoint
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Query parameters workers pass when polling / posting.
///
/// `executionProvider`/`canUseGPU` are legacy hardware hints older worker
/// SDKs pass on every poll; they are stored against the module's status
/// and never interpreted.
#[derive(Debug, Deserialize)]
struct WorkerQuery {
    #[serde(rename = "moduleId")]
    module_id: Option<String>,
    #[serde(rename = "executionProvider")]
    execution_provider: Option<String>,
    #[serde(rename = "canUseGPU")]
    can_use_gpu: Option<bool>,
}

/// GET /v1/queue/:name - long-poll for the oldest pending request
async fn get_queue_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Query(query): Query<WorkerQuery>,
) -> Response {
    if let Some(module_id) = &query.module_id {
        state.supervisor.worker_seen(module_id);
        if let Some(provider) = &query.execution_provider {
            state
                .supervisor
                .note_inference_device(module_id, provider, query.can_use_gpu);
        }
    }

    let timeout = state.config.queue.command_dequeue_timeout();
    match state.broker.dequeue(&name, timeout, &state.shutdown).await {
        Ok(Some(request)) => (StatusCode::OK, Json(request)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        // Shutdown in progress: tell the worker there is no work so it
        // disconnects promptly instead of riding out the poll timeout.
        Err(CoreError::Cancelled { .. }) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_broker_error(&e).into_response(),
    }
}

/// POST /v1/queue/:reqid - set the response for a request
///
/// Always `200` once the body parses, even when the reqid is unknown or
/// expired: result posting is fire-and-forget for workers.
async fn set_response_handler(
    State(state): State<ServerState>,
    Path(reqid): Path<String>,
    Query(query): Query<WorkerQuery>,
    body: String,
) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ModuleResponse::error(format!("invalid JSON response: {e}"), 400).to_value()),
            )
                .into_response();
        }
    };

    // The module may identify itself in the query or in the response body.
    let module_id = query.module_id.clone().or_else(|| {
        value
            .get("moduleId")
            .and_then(Value::as_str)
            .map(str::to_owned)
    });

    if let Some(module_id) = &module_id {
        state.supervisor.worker_seen(module_id);
        state.supervisor.record_result(module_id);
        if let Some(Value::Object(status_data)) = value.get("statusData") {
            state
                .supervisor
                .update_status_data(module_id, status_data.clone());
        }
    }

    let response = match ModuleResponse::from_value(value) {
        Ok(response) => response,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ModuleResponse::error(e.to_string(), 400).to_value()),
            )
                .into_response();
        }
    };

    let delivered = state.broker.set_result(&reqid, response);
    if !delivered {
        tracing::debug!(%reqid, "Result arrived for an expired request");
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "message": "Response saved."})),
    )
        .into_response()
}

/// POST /v1/queue/updatemodulestatus/:module_id - store worker status data
async fn update_module_status_handler(
    State(state): State<ServerState>,
    Path(module_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Value::Object(status_data) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ModuleResponse::error("status data must be a JSON object", 400).to_value()),
        )
            .into_response();
    };

    state.supervisor.worker_seen(&module_id);
    if state.supervisor.update_status_data(&module_id, status_data) {
        (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "message": "Module status updated"})),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ModuleResponse::error(format!("module '{module_id}' not found"), 404).to_value()),
        )
            .into_response()
    }
}

/// One row of the status listing: the process snapshot plus the live
/// occupancy of the module's queue.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleStatusEntry {
    #[serde(flatten)]
    status: ProcessStatus,
    queue_depth: usize,
}

/// GET /v1/status/modules - snapshot of every module's process status
async fn module_statuses_handler(State(state): State<ServerState>) -> Json<Vec<ModuleStatusEntry>> {
    let entries = state
        .supervisor
        .statuses()
        .into_iter()
        .map(|status| {
            let queue_depth = state.broker.queue_depth(&status.queue).unwrap_or(0);
            ModuleStatusEntry {
                status,
                queue_depth,
            }
        })
        .collect();
    Json(entries)
}
