//! HTTP API for health checks, status, and operator actions

use crate::chain::{DestinationChain, SourceChain};
use crate::config::ApiConfig;
use crate::coordination::{DepositLedger, RelayState, RelayStatus};
use crate::error::{RelayerError, RelayerResult};
use crate::state::{Deposit, DepositId, DepositStats, FillAttempt, StateStore};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Upper bound for dependency checks in `/ready` and `/status`
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub ledger: Arc<DepositLedger>,
    pub status: watch::Receiver<RelayStatus>,
    pub source: Arc<dyn SourceChain>,
    pub destination: Arc<dyn DestinationChain>,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/deposits/:id", get(get_deposit))
        .route("/deposits/:id/retry", post(retry_deposit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - database, both chains and a running coordinator
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let (database, source, destination) = tokio::join!(
        reachable(state.store.health_check()),
        reachable(state.source.get_head()),
        reachable(state.destination.get_head()),
    );
    let relay_state = state.status.borrow().state;

    let ready = database && source && destination && relay_state == RelayState::Running;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            ready,
            database,
            source_chain: source,
            destination_chain: destination,
            relay_state,
        }),
    )
}

async fn reachable<T>(check: impl std::future::Future<Output = RelayerResult<T>>) -> bool {
    matches!(tokio::time::timeout(CHECK_TIMEOUT, check).await, Ok(Ok(_)))
}

/// Coordinator progress and chain heads
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let relay = *state.status.borrow();
    let source_head = tokio::time::timeout(CHECK_TIMEOUT, state.source.get_head())
        .await
        .ok()
        .and_then(Result::ok);

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        state: relay.state,
        source_chain_id: relay.source_chain_id,
        destination_chain_id: state.destination.chain_id(),
        last_safe_block: relay.last_safe_block,
        source_head,
        queued: relay.queued,
        in_flight: relay.in_flight,
        open_deposits: state.ledger.open_count(),
    })
}

/// Deposit counts per status
async fn get_stats(State(state): State<AppState>) -> Response {
    match state.store.get_stats().await {
        Ok(stats) => (StatusCode::OK, Json::<DepositStats>(stats)).into_response(),
        Err(e) => error_response(e),
    }
}

/// A deposit with its fill attempts
async fn get_deposit(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match id.parse::<DepositId>() {
        Ok(id) => id,
        Err(e) => return bad_request(e),
    };

    let deposit = match state.store.get_deposit(&id).await {
        Ok(Some(deposit)) => deposit,
        Ok(None) => return error_response(RelayerError::DepositNotFound { id: id.to_string() }),
        Err(e) => return error_response(e),
    };

    match state.store.get_attempts(&id).await {
        Ok(attempts) => Json(DepositResponse { deposit, attempts }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Release a failed deposit back into the fill queue
async fn retry_deposit(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match id.parse::<DepositId>() {
        Ok(id) => id,
        Err(e) => return bad_request(e),
    };

    match state.ledger.release_for_retry(&id).await {
        Ok(deposit) => {
            info!("Deposit {} released for retry", id);
            Json(deposit).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn bad_request(e: RelayerError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn error_response(e: RelayerError) -> Response {
    let code = match &e {
        RelayerError::DepositNotFound { .. } => StatusCode::NOT_FOUND,
        RelayerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => {
            warn!("API request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        code,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    source_chain: bool,
    destination_chain: bool,
    relay_state: RelayState,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    state: RelayState,
    source_chain_id: u64,
    destination_chain_id: u64,
    last_safe_block: u64,
    source_head: Option<u64>,
    queued: usize,
    in_flight: usize,
    open_deposits: usize,
}

#[derive(Serialize)]
struct DepositResponse {
    deposit: Deposit,
    attempts: Vec<FillAttempt>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DepositStatus, MemoryStore};
    use crate::test_utils::{FakeDestinationChain, FakeSourceChain};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::{Address, H256, U256};
    use tower::ServiceExt;

    struct Harness {
        ledger: Arc<DepositLedger>,
        status: watch::Sender<RelayStatus>,
        app: Router,
    }

    fn harness() -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(store.clone()));
        let (status, receiver) = watch::channel(RelayStatus {
            state: RelayState::Running,
            source_chain_id: 1,
            last_safe_block: 1001,
            queued: 0,
            in_flight: 0,
        });

        let app = router(AppState {
            store,
            ledger: ledger.clone(),
            status: receiver,
            source: Arc::new(FakeSourceChain::new(1, 1013)),
            destination: Arc::new(FakeDestinationChain::new(534352)),
            started: Instant::now(),
        });

        Harness {
            ledger,
            status,
            app,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn failed_deposit(ledger: &DepositLedger) -> DepositId {
        let deposit = Deposit::observed(
            H256::repeat_byte(0xaa),
            0,
            Address::repeat_byte(0xde),
            U256::from(100),
            1000,
        );
        let id = deposit.id;
        ledger.upsert(deposit).await.unwrap();
        ledger.advance(&id, DepositStatus::Confirmed).await.unwrap();
        ledger.advance(&id, DepositStatus::Submitting).await.unwrap();
        ledger.record_failure(&id, "Fill reverted").await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_health() {
        let harness = harness();
        let (status, body) = send(&harness.app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_requires_running_coordinator() {
        let harness = harness();
        let (status, body) = send(&harness.app, "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        harness
            .status
            .send_modify(|status| status.state = RelayState::Draining);
        let (status, body) = send(&harness.app, "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["relay_state"], "draining");
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let harness = harness();
        let (status, body) = send(&harness.app, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "running");
        assert_eq!(body["last_safe_block"], 1001);
        assert_eq!(body["source_head"], 1013);
        assert_eq!(body["destination_chain_id"], 534352);
    }

    #[tokio::test]
    async fn test_deposit_lookup() {
        let harness = harness();
        let id = failed_deposit(&harness.ledger).await;

        let (status, body) = send(&harness.app, "GET", &format!("/deposits/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deposit"]["status"], "failed");
        assert_eq!(body["attempts"].as_array().unwrap().len(), 0);

        let missing = DepositId(H256::repeat_byte(0x01));
        let (status, _) = send(&harness.app, "GET", &format!("/deposits/{}", missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&harness.app, "GET", "/deposits/0x1234").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_releases_failed_deposit_once() {
        let harness = harness();
        let id = failed_deposit(&harness.ledger).await;
        let uri = format!("/deposits/{}/retry", id);

        let (status, body) = send(&harness.app, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retryable"], true);

        harness
            .ledger
            .advance(&id, DepositStatus::Submitting)
            .await
            .unwrap();
        let (status, _) = send(&harness.app, "POST", &uri).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let stats = send(&harness.app, "GET", "/stats").await.1;
        assert_eq!(stats["submitting"], 1);
    }
}
