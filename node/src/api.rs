//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the vault's HTTP interface. All
//! endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                                | Description                      |
//! |--------|-------------------------------------|----------------------------------|
//! | GET    | `/health`                           | Liveness probe                   |
//! | GET    | `/status`                           | Version, owner, totals           |
//! | GET    | `/vault/balance`                    | Custody balance                  |
//! | GET    | `/vault/totals`                     | Locked / withdrawn / deposited   |
//! | GET    | `/owner`                            | Current owner                    |
//! | GET    | `/accounts/:address/deposits`       | All deposits of an account       |
//! | GET    | `/accounts/:address/deposits/count` | Deposit count                    |
//! | GET    | `/accounts/:address/deposits/:id`   | One deposit and its state        |
//! | GET    | `/events?from=&limit=`              | Page of the event log            |
//! | POST   | `/deposits`                         | Lock value                       |
//! | POST   | `/withdrawals`                      | Withdraw an unlocked deposit     |
//! | POST   | `/ownership`                        | Transfer ownership               |
//! | GET    | `/ws`                               | WebSocket for live events        |
//!
//! Amounts travel as decimal strings so `u128` values survive JSON clients.
//! The `caller` field of a mutating request is trusted as-is; authenticating
//! it is the job of whatever sits in front of this API.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use timelock_contracts::{ErrorKind, EventListener, Vault, VaultError, VaultResult};
use timelock_protocol::config::DEFAULT_EVENT_PAGE;
use timelock_protocol::{Address, Deposit, DepositId, EventRecord, Timestamp, VaultEvent};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The vault service.
    pub vault: Arc<Vault>,
    /// Broadcast channel for live event notifications.
    pub event_tx: broadcast::Sender<EventView>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

/// Forwards committed vault events to metrics and WebSocket subscribers.
pub struct EventBridge {
    pub event_tx: broadcast::Sender<EventView>,
    pub metrics: SharedMetrics,
}

impl EventListener for EventBridge {
    fn on_event(&self, record: &EventRecord) {
        self.metrics.record_event(record);
        // No subscribers is fine.
        let _ = self.event_tx.send(EventView::from(record));
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/vault/balance", get(balance_handler))
        .route("/vault/totals", get(totals_handler))
        .route("/owner", get(owner_handler))
        .route("/accounts/:address/deposits", get(deposits_handler))
        .route("/accounts/:address/deposits/count", get(deposit_count_handler))
        .route("/accounts/:address/deposits/:id", get(deposit_handler))
        .route("/events", get(events_handler))
        .route("/deposits", post(deposit_post_handler))
        .route("/withdrawals", post(withdraw_handler))
        .route("/ownership", post(ownership_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// A failed request: status code plus [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    fn bad_request(kind: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Storage.to_string(),
            message: message.into(),
        }
    }
}

/// HTTP status for each vault error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidAmount
        | ErrorKind::InvalidAddress
        | ErrorKind::LockDurationTooLong
        | ErrorKind::ArithmeticOverflow => StatusCode::BAD_REQUEST,
        ErrorKind::NoSuchDeposit => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyWithdrawn | ErrorKind::StillLocked => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::TransferFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::NotInitialized | ErrorKind::AlreadyInitialized | ErrorKind::Storage => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        let kind = e.kind();
        Self {
            status: status_for(kind),
            kind: kind.to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_address(raw: &str) -> ApiResult<Address> {
    raw.parse()
        .map_err(|e| ApiError::bad_request("InvalidAddress", format!("{raw}: {e}")))
}

fn parse_amount(raw: &str) -> ApiResult<u128> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request("InvalidAmount", format!("not a decimal amount: {raw}")))
}

fn parse_deposit_id(raw: &str) -> ApiResult<DepositId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("BadRequest", format!("not a deposit id: {raw}")))
}

// ---------------------------------------------------------------------------
// Request & Response Types
// ---------------------------------------------------------------------------

/// Body of `POST /deposits`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    pub caller: String,
    /// Decimal wei.
    pub value: String,
    /// Seconds; `0` means immediately withdrawable.
    #[serde(default)]
    pub lock_duration: Timestamp,
}

/// Body of `POST /withdrawals`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub caller: String,
    pub deposit_id: DepositId,
}

/// Body of `POST /ownership`.
#[derive(Debug, Serialize, Deserialize)]
pub struct OwnershipRequest {
    pub caller: String,
    pub new_owner: String,
}

/// One deposit as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct DepositResponse {
    pub account: String,
    pub deposit_id: DepositId,
    pub amount: String,
    pub unlock_time: Timestamp,
    pub exists: bool,
    /// `non_existent`, `locked`, `unlocked` or `withdrawn`.
    pub state: String,
}

impl DepositResponse {
    fn new(account: &Address, deposit_id: DepositId, deposit: &Deposit, now: Timestamp) -> Self {
        let state = serde_json::to_value(deposit.state(now))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            account: account.to_hex(),
            deposit_id,
            amount: deposit.amount.to_string(),
            unlock_time: deposit.unlock_time,
            exists: deposit.exists,
            state,
        }
    }
}

/// Response payload for `GET /accounts/:address/deposits`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountDepositsResponse {
    pub address: String,
    pub count: u64,
    pub deposits: Vec<DepositResponse>,
}

/// Response payload for `GET /accounts/:address/deposits/count`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DepositCountResponse {
    pub address: String,
    pub count: u64,
}

/// Response payload for `GET /vault/totals`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TotalsResponse {
    pub total_locked: String,
    pub total_withdrawn: String,
    pub total_deposited: String,
    pub vault_balance: String,
}

impl TotalsResponse {
    fn from_vault(vault: &Vault) -> Self {
        let totals = vault.totals();
        Self {
            total_locked: totals.total_locked.to_string(),
            total_withdrawn: totals.total_withdrawn.to_string(),
            total_deposited: totals.total_deposited.to_string(),
            vault_balance: vault.get_vault_balance().to_string(),
        }
    }
}

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    pub owner: String,
    pub totals: TotalsResponse,
    pub accounts: usize,
    pub event_count: u64,
    pub pending_withdrawals: usize,
    /// Configured lock cap in seconds, if any.
    pub max_lock_duration: Option<Timestamp>,
    /// Vault clock, Unix seconds.
    pub now: Timestamp,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Response payload for `POST /withdrawals`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub account: String,
    pub deposit_id: DepositId,
    pub amount: String,
}

/// Response payload for `GET /owner` and `POST /ownership`.
#[derive(Debug, Serialize, Deserialize)]
pub struct OwnerResponse {
    pub owner: String,
}

/// Query string of `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub from: u64,
    pub limit: Option<usize>,
}

/// Response payload for `GET /events`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<EventView>,
    /// Sequence to pass as `from` for the next page.
    pub next: u64,
    /// Records in the log.
    pub total: u64,
}

/// An event record as seen by API and WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventView {
    pub sequence: u64,
    pub hash: String,
    pub prev_hash: String,
    /// `deposited`, `withdrawn`, `ownership_transferred` or `external_credit`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_id: Option<DepositId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_owner: Option<String>,
}

impl From<&EventRecord> for EventView {
    fn from(record: &EventRecord) -> Self {
        let mut view = EventView {
            sequence: record.sequence,
            hash: record.hash_hex(),
            prev_hash: record.prev_hash_hex(),
            kind: record.event.kind().to_string(),
            account: None,
            deposit_id: None,
            amount: None,
            unlock_time: None,
            timestamp: None,
            previous_owner: None,
            new_owner: None,
        };
        match &record.event {
            VaultEvent::Deposited {
                account,
                deposit_id,
                amount,
                unlock_time,
                timestamp,
            } => {
                view.account = Some(account.to_hex());
                view.deposit_id = Some(*deposit_id);
                view.amount = Some(amount.to_string());
                view.unlock_time = Some(*unlock_time);
                view.timestamp = Some(*timestamp);
            }
            VaultEvent::Withdrawn {
                account,
                deposit_id,
                amount,
                timestamp,
            } => {
                view.account = Some(account.to_hex());
                view.deposit_id = Some(*deposit_id);
                view.amount = Some(amount.to_string());
                view.timestamp = Some(*timestamp);
            }
            VaultEvent::OwnershipTransferred {
                previous_owner,
                new_owner,
            } => {
                view.previous_owner = Some(previous_owner.to_hex());
                view.new_owner = Some(new_owner.to_hex());
            }
            VaultEvent::ExternalCredit { amount, timestamp } => {
                view.amount = Some(amount.to_string());
                view.timestamp = Some(*timestamp);
            }
        }
        view
    }
}

// ---------------------------------------------------------------------------
// Read Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the node is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.).
/// It intentionally does not check internal subsystem health — that
/// belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — returns the vault summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let vault = &state.vault;
    Json(StatusResponse {
        version: state.version.clone(),
        owner: vault.owner().to_hex(),
        totals: TotalsResponse::from_vault(vault),
        accounts: vault.account_count(),
        event_count: vault.event_count(),
        pending_withdrawals: vault.pending_withdrawals().len(),
        max_lock_duration: vault.config().max_lock_duration,
        now: vault.now(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /vault/balance`
async fn balance_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "balance": state.vault.get_vault_balance().to_string() }))
}

/// `GET /vault/totals`
async fn totals_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(TotalsResponse::from_vault(&state.vault))
}

/// `GET /owner`
async fn owner_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(OwnerResponse {
        owner: state.vault.owner().to_hex(),
    })
}

/// `GET /accounts/:address/deposits` — every deposit of an account, in id
/// order. Unknown accounts get an empty list.
async fn deposits_handler(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<AccountDepositsResponse>> {
    let account = parse_address(&address)?;
    let now = state.vault.now();
    let deposits: Vec<DepositResponse> = state
        .vault
        .deposits_of(&account)
        .iter()
        .enumerate()
        .map(|(id, d)| DepositResponse::new(&account, id as DepositId, d, now))
        .collect();
    Ok(Json(AccountDepositsResponse {
        address: account.to_hex(),
        count: deposits.len() as u64,
        deposits,
    }))
}

/// `GET /accounts/:address/deposits/count`
async fn deposit_count_handler(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<DepositCountResponse>> {
    let account = parse_address(&address)?;
    Ok(Json(DepositCountResponse {
        address: account.to_hex(),
        count: state.vault.get_deposit_count(&account),
    }))
}

/// `GET /accounts/:address/deposits/:id` — never 404: unknown ids come back
/// as the zero-valued, non-existent deposit.
async fn deposit_handler(
    Path((address, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<Json<DepositResponse>> {
    let account = parse_address(&address)?;
    let deposit_id = parse_deposit_id(&id)?;
    let deposit = state.vault.get_deposit(&account, deposit_id);
    Ok(Json(DepositResponse::new(
        &account,
        deposit_id,
        &deposit,
        state.vault.now(),
    )))
}

/// `GET /events?from=&limit=` — a page of the event log.
async fn events_handler(
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<EventsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    let records = state.vault.events(query.from, limit)?;
    let next = records.last().map_or(query.from, |r| r.sequence + 1);
    Ok(Json(EventsResponse {
        events: records.iter().map(EventView::from).collect(),
        next,
        total: state.vault.event_count(),
    }))
}

// ---------------------------------------------------------------------------
// Mutating Handlers
// ---------------------------------------------------------------------------

/// Runs a vault mutation on the blocking pool, timing it and counting
/// failures.
async fn run_mutation<T, F>(state: &AppState, operation: &'static str, f: F) -> ApiResult<T>
where
    F: FnOnce(&Vault) -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    let vault = Arc::clone(&state.vault);
    let timer = state
        .metrics
        .operation_latency_seconds
        .with_label_values(&[operation])
        .start_timer();
    let result = tokio::task::spawn_blocking(move || f(&vault))
        .await
        .map_err(|e| ApiError::internal(format!("{operation} task failed: {e}")))?;
    timer.observe_duration();

    match result {
        Ok(value) => {
            state.metrics.observe_vault(&state.vault);
            Ok(value)
        }
        Err(e) => {
            state
                .metrics
                .failed_operations_total
                .with_label_values(&[operation, e.kind().as_str()])
                .inc();
            Err(e.into())
        }
    }
}

/// `POST /deposits` — returns 201 with the created deposit.
async fn deposit_post_handler(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<(StatusCode, Json<DepositResponse>)> {
    let caller = parse_address(&req.caller)?;
    let value = parse_amount(&req.value)?;
    let lock_duration = req.lock_duration;

    let deposit_id = run_mutation(&state, "deposit", move |vault| {
        vault.deposit(caller, value, lock_duration)
    })
    .await?;

    let deposit = state.vault.get_deposit(&caller, deposit_id);
    Ok((
        StatusCode::CREATED,
        Json(DepositResponse::new(
            &caller,
            deposit_id,
            &deposit,
            state.vault.now(),
        )),
    ))
}

/// `POST /withdrawals`
async fn withdraw_handler(
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<Json<WithdrawResponse>> {
    let caller = parse_address(&req.caller)?;
    let deposit_id = req.deposit_id;

    let amount = run_mutation(&state, "withdraw", move |vault| {
        vault.withdraw(caller, deposit_id)
    })
    .await?;

    Ok(Json(WithdrawResponse {
        account: caller.to_hex(),
        deposit_id,
        amount: amount.to_string(),
    }))
}

/// `POST /ownership`
async fn ownership_handler(
    State(state): State<AppState>,
    Json(req): Json<OwnershipRequest>,
) -> ApiResult<Json<OwnerResponse>> {
    let caller = parse_address(&req.caller)?;
    let new_owner = parse_address(&req.new_owner)?;

    run_mutation(&state, "transfer_ownership", move |vault| {
        vault.transfer_ownership(caller, new_owner)
    })
    .await?;

    Ok(Json(OwnerResponse {
        owner: state.vault.owner().to_hex(),
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `GET /ws` — WebSocket upgrade for live event streaming.
///
/// Clients receive one JSON-encoded [`EventView`] per committed event. The
/// connection is read-only from the server's perspective; client messages
/// are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Clients can backfill from /events.
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
