use crate::{
    engine::{InboundEffect, ProtocolEngine},
    error::ProtocolError,
    model::{AckResponse, Action, TransactionError},
    settlement::Settlement,
    signing::{AUTHORIZATION_HEADER, DIGEST_HEADER},
    transaction::TransactionState,
    verification::VerificationCase,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub type AppState = Arc<ProtocolEngine>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/transactions", get(list_transactions))
        .route("/transactions/:transaction_id", get(get_transaction))
        .route("/verification/:case_id", get(get_case))
        .route("/settlements/:settlement_id", get(get_settlement))
        .route("/:action", post(handle_action))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

fn nack(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(AckResponse::nack(TransactionError::new(code, message)))).into_response()
}

/// Maps an engine error to a NACK. Authentication failures get one generic
/// body so callers cannot tell which check failed.
fn error_response(err: &ProtocolError) -> Response {
    if err.is_auth_failure() {
        tracing::warn!(error = %err, "Rejected unauthenticated message");
        return nack(StatusCode::UNAUTHORIZED, "10001", "Unauthorized");
    }

    match err {
        ProtocolError::InvalidPayload(_) | ProtocolError::Serialization(_) | ProtocolError::InvalidTolerance(_) => {
            nack(StatusCode::BAD_REQUEST, "20001", err.to_string())
        }
        ProtocolError::NotFound(_) | ProtocolError::CaseNotFound(_) | ProtocolError::SettlementNotFound(_) => {
            nack(StatusCode::NOT_FOUND, "30004", err.to_string())
        }
        ProtocolError::IllegalTransition { .. }
        | ProtocolError::IllegalSettlementTransition { .. }
        | ProtocolError::AlreadyExists(_)
        | ProtocolError::AlreadyDecided(_)
        | ProtocolError::CaseNotDecided(_) => nack(StatusCode::CONFLICT, "30009", err.to_string()),
        ProtocolError::StoreUnavailable(_) => {
            tracing::error!(error = %err, "Store unavailable");
            nack(StatusCode::SERVICE_UNAVAILABLE, "50001", "Temporarily unavailable")
        }
        _ => {
            tracing::error!(error = %err, "Failed to process message");
            nack(StatusCode::INTERNAL_SERVER_ERROR, "50000", "Internal error")
        }
    }
}

async fn handle_action(
    State(engine): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let action = match action.parse::<Action>() {
        Ok(action) => action,
        Err(err) => return nack(StatusCode::NOT_FOUND, "20002", err.to_string()),
    };

    let authorization = match headers.get(AUTHORIZATION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) => value,
        None => return nack(StatusCode::UNAUTHORIZED, "10001", "Unauthorized"),
    };
    let digest = headers.get(DIGEST_HEADER).and_then(|v| v.to_str().ok());

    match engine.handle_inbound(Some(action), authorization, digest, &body).await {
        Ok(result) => {
            if result.effect == InboundEffect::Duplicate {
                tracing::debug!(message_id = %result.context.message_id, "Acknowledged duplicate");
            }
            (StatusCode::OK, Json(AckResponse::ack())).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn list_transactions(State(engine): State<AppState>) -> Result<Json<Vec<TransactionState>>, StatusCode> {
    engine
        .transactions()
        .get_all_transaction_states()
        .await
        .map(Json)
        .map_err(|err| {
            tracing::error!(error = %err, "Failed to list transactions");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

async fn get_transaction(
    State(engine): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionState>, StatusCode> {
    match engine.transactions().get_transaction_state(&transaction_id).await {
        Ok(Some(state)) => Ok(Json(state)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(transaction_id = %transaction_id, error = %err, "Failed to read transaction");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn get_case(
    State(engine): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<VerificationCase>, StatusCode> {
    match engine.verification().get_case(&case_id).await {
        Ok(case) => Ok(Json(case)),
        Err(ProtocolError::CaseNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(case_id = %case_id, error = %err, "Failed to read verification case");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn get_settlement(
    State(engine): State<AppState>,
    Path(settlement_id): Path<String>,
) -> Result<Json<Settlement>, StatusCode> {
    match engine.verification().get_settlement(&settlement_id).await {
        Ok(settlement) => Ok(Json(settlement)),
        Err(ProtocolError::SettlementNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(settlement_id = %settlement_id, error = %err, "Failed to read settlement");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn health_check(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "subscriber_id": engine.identity().subscriber_id,
        "key_id": engine.key_id().to_string(),
        "known_keys": engine.registry().len(),
    }))
}
