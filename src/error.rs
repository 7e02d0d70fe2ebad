use thiserror::Error;

use crate::settlement::SettlementState;
use crate::transaction::TransactionStatus;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    // Signing / verification
    #[error("Malformed signature header: {0}")]
    MalformedHeader(String),

    #[error("Signature expired: {0}")]
    Expired(String),

    #[error("Signature verification failed: {0}")]
    TamperDetected(String),

    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),

    // Transaction store
    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Transaction already exists: {0}")]
    AlreadyExists(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Illegal transition for {transaction_id}: {from} -> {to}")]
    IllegalTransition {
        transaction_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    // Verification / settlement
    #[error("Invalid tolerance: {0}")]
    InvalidTolerance(String),

    #[error("Verification case not found: {0}")]
    CaseNotFound(String),

    #[error("Verification case already decided: {0}")]
    AlreadyDecided(String),

    #[error("Verification case not decided: {0}")]
    CaseNotDecided(String),

    #[error("Settlement not found: {0}")]
    SettlementNotFound(String),

    #[error("Illegal settlement transition for {settlement_id}: {from:?} -> {to:?}")]
    IllegalSettlementTransition {
        settlement_id: String,
        from: SettlementState,
        to: SettlementState,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // Ambient
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Only transport-ish failures are worth a caller-side retry. The engine
    /// itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::StoreUnavailable(_) | ProtocolError::Network(_))
    }

    /// Errors that map to a generic 401 at the transport boundary.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedHeader(_)
                | ProtocolError::Expired(_)
                | ProtocolError::TamperDetected(_)
                | ProtocolError::UnknownKeyId(_)
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::MalformedHeader(format!("invalid base64: {}", err))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProtocolError::StoreUnavailable(format!("store operation timed out: {}", err))
    }
}
