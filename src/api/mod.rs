//! HTTP API for submitting transfers, driving batches, and health checks

use crate::batch::{ExecutionOutcome, OutgoingBatch};
use crate::config::{parse_address, ApiConfig};
use crate::coordination::CoordinatorHandle;
use crate::error::{BatchError, BatcherError, BatcherResult};
use crate::pool::{NewTransfer, TransferRequest};
use crate::state::StateManager;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub handle: CoordinatorHandle,
    pub state_manager: Arc<StateManager>,
    pub started_at: DateTime<Utc>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/transfers", post(submit_transfer))
        .route("/transfers/:id", delete(withdraw_transfer))
        .route("/pool/:denom", get(get_pool))
        .route("/batches", get(list_batches).post(create_batch))
        .route("/batches/:contract/:nonce", get(get_batch))
        .route("/batches/:contract/:nonce/executed", post(confirm_executed))
        .route("/batches/:contract/:nonce/cancel", post(cancel_batch))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> BatcherResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Error response carrying the status derived from the failure kind
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<BatcherError> for ApiError {
    fn from(err: BatcherError) -> Self {
        let status = match &err {
            BatcherError::Batch(batch) => match batch {
                BatchError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
                BatchError::UnknownDenomination { .. }
                | BatchError::UnknownBatch { .. }
                | BatchError::UnknownTransfer { .. } => StatusCode::NOT_FOUND,
                BatchError::EmptySelection { .. } => StatusCode::CONFLICT,
                BatchError::FeeOverflow { .. } | BatchError::ConversionOverflow { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                BatchError::PoolInvariant { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            BatcherError::CoordinatorStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("API request failed: {}", err);
        }

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn batch_key(contract: &str, nonce: u64) -> Result<(Address, u64), ApiError> {
    let token_contract = parse_address(contract).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok((token_contract, nonce))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - snapshot storage writable, coordinator running and
/// the latest state persisted
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.state_manager.health_check().await.is_ok();
    let (coordinator, persisted) = match state.handle.status().await {
        Ok(status) => (true, status.persisted),
        Err(_) => (false, false),
    };
    let ready = storage && coordinator && persisted;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            storage,
            coordinator,
            persisted,
        }),
    )
}

/// Get batcher status
async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = state.handle.status().await?;
    let uptime = Utc::now() - state.started_at;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        transfers: status.transfers,
        pending_batches: status.pending_batches,
        persisted: status.persisted,
        unbatched: status
            .unbatched
            .into_iter()
            .map(|(denom, count)| DenomDepth { denom, count })
            .collect(),
    }))
}

async fn submit_transfer(
    State(state): State<AppState>,
    Json(transfer): Json<NewTransfer>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = state.handle.submit_transfer(transfer).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

async fn withdraw_transfer(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<TransferRequest> {
    Ok(Json(state.handle.withdraw_transfer(id).await?))
}

/// Unbatched transfers of a denom in selection order
async fn get_pool(
    State(state): State<AppState>,
    Path(denom): Path<String>,
) -> ApiResult<Vec<TransferRequest>> {
    Ok(Json(state.handle.list_pool(denom).await?))
}

async fn list_batches(State(state): State<AppState>) -> ApiResult<Vec<OutgoingBatch>> {
    Ok(Json(state.handle.list_batches().await?))
}

async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<OutgoingBatch>), ApiError> {
    let batch = state
        .handle
        .create_batch(request.denom, request.max_elements)
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn get_batch(
    State(state): State<AppState>,
    Path((contract, nonce)): Path<(String, u64)>,
) -> ApiResult<OutgoingBatch> {
    let (token_contract, nonce) = batch_key(&contract, nonce)?;
    match state.handle.get_batch(token_contract, nonce).await? {
        Some(batch) => Ok(Json(batch)),
        None => Err(ApiError::not_found(format!(
            "Batch {} not found for token contract {:?}",
            nonce, token_contract
        ))),
    }
}

async fn confirm_executed(
    State(state): State<AppState>,
    Path((contract, nonce)): Path<(String, u64)>,
) -> ApiResult<ExecutionOutcome> {
    let (token_contract, nonce) = batch_key(&contract, nonce)?;
    Ok(Json(state.handle.confirm_executed(token_contract, nonce).await?))
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path((contract, nonce)): Path<(String, u64)>,
) -> ApiResult<OutgoingBatch> {
    let (token_contract, nonce) = batch_key(&contract, nonce)?;
    Ok(Json(state.handle.cancel_batch(token_contract, nonce).await?))
}

// Request/Response types

#[derive(Debug, Deserialize)]
struct CreateBatchRequest {
    denom: String,
    #[serde(default)]
    max_elements: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    storage: bool,
    coordinator: bool,
    persisted: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    transfers: usize,
    pending_batches: usize,
    persisted: bool,
    unbatched: Vec<DenomDepth>,
}

#[derive(Serialize)]
struct DenomDepth {
    denom: String,
    count: usize,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchManager;
    use crate::config::{BatcherConfig, StateConfig};
    use crate::coordination::BatchCoordinator;
    use crate::denom::{BridgedDenominator, DenomRegistry};
    use crate::events::{BridgeIdentity, BroadcastEventSink};
    use crate::pool::TransferPool;
    use crate::store::MemoryBatchStore;
    use crate::valset::{StaticValsetProvider, Valset};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::U256;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::watch;
    use tower::ServiceExt;

    const TOKEN: &str = "0x0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c";

    struct TestApp {
        router: Router,
        _shutdown: watch::Sender<bool>,
        dir: TempDir,
    }

    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let state_manager = Arc::new(
            StateManager::new(&StateConfig {
                snapshot_path: dir.path().join("batcher.json"),
            })
            .await
            .unwrap(),
        );

        let mut registry = DenomRegistry::new();
        registry.register(
            "voucher",
            BridgedDenominator {
                token_contract: Address::repeat_byte(0x0c),
                symbol: "TKN".to_string(),
                conversion_factor: U256::one(),
            },
        );
        let manager = BatchManager::new(
            TransferPool::new(),
            MemoryBatchStore::new(),
            Arc::new(registry),
            Arc::new(StaticValsetProvider::new(Valset::default())),
            Arc::new(BroadcastEventSink::new(16)),
            BridgeIdentity {
                contract_address: Address::repeat_byte(0xbb),
                chain_id: 1,
            },
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (coordinator, handle) = BatchCoordinator::new(
            manager,
            state_manager.clone(),
            BatcherConfig {
                poll_interval_ms: 1000,
                max_batch_size: 10,
                auto_batch: false,
                health_check_interval_secs: 60,
            },
            vec!["voucher".to_string()],
            shutdown_rx,
        );
        tokio::spawn(coordinator.run());

        TestApp {
            router: router(AppState {
                handle,
                state_manager,
                started_at: Utc::now(),
            }),
            _shutdown: shutdown,
            dir,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn transfer(fee: &str) -> Value {
        json!({
            "sender": "cosmos1sender",
            "dest_address": "0x2222222222222222222222222222222222222222",
            "denom": "voucher",
            "amount": "0x64",
            "fee": fee,
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app.router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_batch_lifecycle_over_http() {
        let app = app().await;

        let (status, body) = call(&app.router, "POST", "/transfers", Some(transfer("0x5"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], 1);
        call(&app.router, "POST", "/transfers", Some(transfer("0x9"))).await;

        let (status, pool) = call(&app.router, "GET", "/pool/voucher", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool[0]["id"], 2);

        let (status, batch) = call(
            &app.router,
            "POST",
            "/batches",
            Some(json!({ "denom": "voucher", "max_elements": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(batch["nonce"], 1);
        assert_eq!(batch["elements"][0]["id"], 2);

        let (status, fetched) = call(&app.router, "GET", &format!("/batches/{}/1", TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, batch);

        let (status, outcome) = call(
            &app.router,
            "POST",
            &format!("/batches/{}/1/executed", TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["canceled"], json!([]));

        let (status, _) = call(
            &app.router,
            "POST",
            &format!("/batches/{}/1/executed", TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app.router, "GET", "/status", None).await;
        assert_eq!(body["transfers"], 1);
        assert_eq!(body["pending_batches"], 0);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = app().await;

        let (status, body) = call(
            &app.router,
            "POST",
            "/batches",
            Some(json!({ "denom": "voucher" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("voucher"));

        let (status, _) = call(
            &app.router,
            "POST",
            "/batches",
            Some(json!({ "denom": "unknown" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app.router,
            "POST",
            "/batches",
            Some(json!({ "denom": "voucher", "max_elements": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app.router, "GET", "/batches/not-an-address/1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app.router, "DELETE", "/transfers/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_is_reported() {
        let app = app().await;
        // A directory at the snapshot path makes the final rename fail
        std::fs::create_dir(app.dir.path().join("batcher.json")).unwrap();

        let (status, body) = call(&app.router, "POST", "/transfers", Some(transfer("0x5"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());

        let (status, body) = call(&app.router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["persisted"], false);

        let (_, pool) = call(&app.router, "GET", "/pool/voucher", None).await;
        assert_eq!(pool, json!([]));
    }
}
