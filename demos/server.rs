//! REST + webhook demo server for the reading ledger engine.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /accounts` - Provision an account with a per-minute rate
//! - `POST /purchases` - Credit purchased credits to an account
//! - `POST /readings` - Book a reading (client, reader, topic, minutes)
//! - `POST /readings/{id}/events` - Apply a lifecycle event
//! - `POST /webhooks/payment` - Payment-processor webhook (idempotent)
//! - `GET /accounts/{id}` - Account snapshot
//! - `GET /readings/{id}` - Reading snapshot
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:3000/accounts \
//!   -H "Content-Type: application/json" \
//!   -d '{"account_id": 1, "rate_per_minute": "1.5"}'
//!
//! curl -X POST http://localhost:3000/purchases \
//!   -H "Content-Type: application/json" \
//!   -d '{"account_id": 1, "amount": 100, "payment_id": "pay_1", "event_id": "evt_1"}'
//!
//! curl -X POST http://localhost:3000/webhooks/payment \
//!   -H "Content-Type: application/json" \
//!   -d '{"id": "evt_2", "type": "payment.succeeded", "payment_id": "pay_2", "reading_id": 1}'
//! ```

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use reading_ledger_rs::{
    AccountId, Actor, DisputeRuling, Engine, EngineError, EntryKind, ExternalEvent,
    ExternalEventKind, ExternalRef, GateOutcome, ReadingEvent, ReadingId, ReconciliationGate,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub account_id: u64,
    pub rate_per_minute: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub account_id: u64,
    pub amount: i64,
    pub payment_id: String,
    /// Processor event id; dedup key for retried submissions.
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BookReadingRequest {
    pub client_id: u64,
    pub reader_id: u64,
    pub topic: String,
    pub duration_minutes: u32,
}

/// Lifecycle event request, tagged by type:
/// ```json
/// {"type": "file_dispute", "actor_id": 1, "reason": "no-show"}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRequest {
    CheckoutStarted,
    Start,
    Complete,
    Cancel,
    FileDispute { actor_id: u64, reason: String },
    ResolveDispute { moderator_id: u64, ruling: DisputeRuling },
}

impl EventRequest {
    fn into_event_and_actor(self) -> (ReadingEvent, Actor) {
        match self {
            Self::CheckoutStarted => (ReadingEvent::CheckoutStarted, Actor::System),
            Self::Start => (ReadingEvent::Start, Actor::System),
            Self::Complete => (ReadingEvent::Complete, Actor::System),
            Self::Cancel => (ReadingEvent::Cancel, Actor::System),
            Self::FileDispute { actor_id, reason } => (
                ReadingEvent::FileDispute { reason },
                Actor::Participant(AccountId(actor_id)),
            ),
            Self::ResolveDispute {
                moderator_id,
                ruling,
            } => (
                ReadingEvent::ResolveDispute { ruling },
                Actor::Moderator(AccountId(moderator_id)),
            ),
        }
    }
}

/// Raw webhook payload; unknown `type` values become a logged no-op.
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payment_id: Option<String>,
    pub reading_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account: u64,
    pub balance: i64,
    pub rate_per_minute: Decimal,
    pub entries: usize,
    pub deactivated: bool,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub gate: Arc<ReconciliationGate>,
}

// === Error Handling ===

/// Wrapper for converting `EngineError` into HTTP responses.
pub struct AppError(EngineError);

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            EngineError::InsufficientBalance { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            EngineError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            EngineError::ReadingNotFound(_) => (StatusCode::NOT_FOUND, "READING_NOT_FOUND"),
            EngineError::DisputeNotFound(_) => (StatusCode::NOT_FOUND, "DISPUTE_NOT_FOUND"),
            EngineError::AccountDeactivated => (StatusCode::FORBIDDEN, "ACCOUNT_DEACTIVATED"),
            EngineError::NotParticipant => (StatusCode::FORBIDDEN, "NOT_PARTICIPANT"),
            EngineError::ModeratorRequired => (StatusCode::FORBIDDEN, "MODERATOR_REQUIRED"),
            EngineError::AlreadyDisputed => (StatusCode::CONFLICT, "ALREADY_DISPUTED"),
            EngineError::DisputeAlreadyResolved => {
                (StatusCode::CONFLICT, "DISPUTE_ALREADY_RESOLVED")
            }
            EngineError::RefundAlreadyIssued => (StatusCode::CONFLICT, "REFUND_ALREADY_ISSUED"),
            EngineError::ConcurrencyConflict => {
                (StatusCode::SERVICE_UNAVAILABLE, "CONCURRENCY_CONFLICT")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /accounts - Provision an account.
async fn open_account(
    State(state): State<AppState>,
    Json(request): Json<OpenAccountRequest>,
) -> StatusCode {
    state
        .engine
        .ledger()
        .open_account(AccountId(request.account_id), request.rate_per_minute);
    StatusCode::CREATED
}

/// POST /purchases - Credit purchased credits.
async fn create_purchase(
    State(state): State<AppState>,
    Json(request): Json<PurchaseRequest>,
) -> Result<StatusCode, AppError> {
    state.engine.ledger().credit(
        AccountId(request.account_id),
        request.amount,
        EntryKind::Purchase,
        ExternalRef::Payment(request.payment_id),
        request.event_id.as_str().into(),
    )?;
    Ok(StatusCode::CREATED)
}

/// POST /readings - Book a reading.
async fn book_reading(
    State(state): State<AppState>,
    Json(request): Json<BookReadingRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let id = state.engine.request_reading(
        AccountId(request.client_id),
        AccountId(request.reader_id),
        request.topic,
        request.duration_minutes,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "reading_id": id })),
    ))
}

/// POST /readings/{id}/events - Apply a lifecycle event.
async fn apply_event(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<EventRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (event, actor) = request.into_event_and_actor();
    let new_state = state.engine.transition(ReadingId(id), event, actor)?;
    Ok(Json(serde_json::json!({ "state": new_state })))
}

/// POST /webhooks/payment - Payment-processor webhook.
///
/// Redeliveries must receive 2xx, so `AlreadyApplied` and `Ignored` are
/// plain 200s.
async fn payment_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, AppError> {
    let event = ExternalEvent {
        idempotency_key: request.id.as_str().into(),
        kind: ExternalEventKind::from_wire(
            &request.kind,
            request.payment_id,
            request.reading_id.map(ReadingId),
        ),
    };
    let outcome = state.gate.apply_external_event(event)?;
    Ok(Json(WebhookResponse {
        outcome: match outcome {
            GateOutcome::Applied(_) => "applied",
            GateOutcome::AlreadyApplied(_) => "already_applied",
            GateOutcome::Ignored => "ignored",
        },
    }))
}

/// GET /accounts/{id} - Account snapshot.
async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AccountResponse>, AppError> {
    let account_id = AccountId(id);
    let ledger = state.engine.ledger();
    let account = ledger
        .get_account(&account_id)
        .ok_or(EngineError::AccountNotFound(account_id))?;
    Ok(Json(AccountResponse {
        account: id,
        balance: account.balance(),
        rate_per_minute: account.rate_per_minute(),
        entries: account.entries().len(),
        deactivated: account.deactivated(),
    }))
}

/// GET /readings/{id} - Reading snapshot.
async fn get_reading(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let reading = state.engine.reading(ReadingId(id))?;
    Ok(Json(serde_json::json!({
        "reading_id": reading.id(),
        "client_id": reading.client_id(),
        "reader_id": reading.reader_id(),
        "topic": reading.topic(),
        "duration_minutes": reading.duration_minutes(),
        "credit_cost": reading.credit_cost(),
        "state": reading.state(),
        "disputed": reading.is_disputed(),
    })))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(open_account))
        .route("/purchases", post(create_purchase))
        .route("/readings", post(book_reading))
        .route("/readings/{id}/events", post(apply_event))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/accounts/{id}", get(get_account))
        .route("/readings/{id}", get(get_reading))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let engine = Arc::new(Engine::new());
    let state = AppState {
        gate: Arc::new(ReconciliationGate::new(Arc::clone(&engine))),
        engine,
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Reading ledger API running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /accounts             - Provision an account");
    println!("  POST /purchases            - Credit purchased credits");
    println!("  POST /readings             - Book a reading");
    println!("  POST /readings/:id/events  - Apply a lifecycle event");
    println!("  POST /webhooks/payment     - Payment webhook (idempotent)");
    println!("  GET  /accounts/:id         - Account snapshot");
    println!("  GET  /readings/:id         - Reading snapshot");

    axum::serve(listener, app).await.unwrap();
}
