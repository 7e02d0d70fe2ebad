use crate::error::{ProtocolError, Result};
use crate::settlement::{Settlement, SettlementBreakdown, SettlementPeriod};
use crate::transaction::TransactionStatus;
use crate::verification::{Proof, RequiredProof, ToleranceRules, VerificationCase, VerificationWindow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "1.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Discover,
    OnDiscover,
    Select,
    OnSelect,
    Init,
    OnInit,
    Confirm,
    OnConfirm,
    Status,
    OnStatus,
    VerificationStart,
    OnVerificationStart,
    SubmitProofs,
    OnProofsSubmitted,
    AcceptVerification,
    OnVerificationAccepted,
    RejectVerification,
    OnVerificationRejected,
    SettlementStart,
    OnSettlementInitiated,
    OnSettlementPending,
    OnSettlementSettled,
    OnSettlementFailed,
}

impl Action {
    pub const ALL: [Action; 23] = [
        Action::Discover,
        Action::OnDiscover,
        Action::Select,
        Action::OnSelect,
        Action::Init,
        Action::OnInit,
        Action::Confirm,
        Action::OnConfirm,
        Action::Status,
        Action::OnStatus,
        Action::VerificationStart,
        Action::OnVerificationStart,
        Action::SubmitProofs,
        Action::OnProofsSubmitted,
        Action::AcceptVerification,
        Action::OnVerificationAccepted,
        Action::RejectVerification,
        Action::OnVerificationRejected,
        Action::SettlementStart,
        Action::OnSettlementInitiated,
        Action::OnSettlementPending,
        Action::OnSettlementSettled,
        Action::OnSettlementFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Discover => "discover",
            Action::OnDiscover => "on_discover",
            Action::Select => "select",
            Action::OnSelect => "on_select",
            Action::Init => "init",
            Action::OnInit => "on_init",
            Action::Confirm => "confirm",
            Action::OnConfirm => "on_confirm",
            Action::Status => "status",
            Action::OnStatus => "on_status",
            Action::VerificationStart => "verification_start",
            Action::OnVerificationStart => "on_verification_start",
            Action::SubmitProofs => "submit_proofs",
            Action::OnProofsSubmitted => "on_proofs_submitted",
            Action::AcceptVerification => "accept_verification",
            Action::OnVerificationAccepted => "on_verification_accepted",
            Action::RejectVerification => "reject_verification",
            Action::OnVerificationRejected => "on_verification_rejected",
            Action::SettlementStart => "settlement_start",
            Action::OnSettlementInitiated => "on_settlement_initiated",
            Action::OnSettlementPending => "on_settlement_pending",
            Action::OnSettlementSettled => "on_settlement_settled",
            Action::OnSettlementFailed => "on_settlement_failed",
        }
    }

    pub fn is_callback(self) -> bool {
        self.as_str().starts_with("on_")
    }

    /// Actions of the verification/settlement extension operate on cases,
    /// not on the negotiation record.
    pub fn is_verification(self) -> bool {
        !matches!(
            self,
            Action::Discover
                | Action::OnDiscover
                | Action::Select
                | Action::OnSelect
                | Action::Init
                | Action::OnInit
                | Action::Confirm
                | Action::OnConfirm
                | Action::Status
                | Action::OnStatus
        )
    }

    /// Status a transaction enters when this request is sent (BAP) or
    /// received (BPP).
    pub fn request_status(self) -> Option<TransactionStatus> {
        match self {
            Action::Select => Some(TransactionStatus::Selecting),
            Action::Init => Some(TransactionStatus::Initializing),
            Action::Confirm => Some(TransactionStatus::Confirming),
            _ => None,
        }
    }

    /// Status a transaction enters when this callback is sent (BPP) or
    /// received (BAP).
    pub fn callback_status(self) -> Option<TransactionStatus> {
        match self {
            Action::OnSelect => Some(TransactionStatus::Selected),
            Action::OnInit => Some(TransactionStatus::Initialized),
            Action::OnConfirm => Some(TransactionStatus::Confirmed),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ProtocolError::InvalidPayload(format!("unknown action: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub domain: String,
    pub action: Action,
    pub version: String,
    pub bap_id: String,
    pub bap_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_uri: Option<String>,
    pub transaction_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl Context {
    pub fn new(
        domain: impl Into<String>,
        action: Action,
        bap_id: impl Into<String>,
        bap_uri: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            action,
            version: PROTOCOL_VERSION.to_string(),
            bap_id: bap_id.into(),
            bap_uri: bap_uri.into(),
            bpp_id: None,
            bpp_uri: None,
            transaction_id: transaction_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            ttl: None,
        }
    }

    pub fn with_bpp(mut self, bpp_id: impl Into<String>, bpp_uri: impl Into<String>) -> Self {
        self.bpp_id = Some(bpp_id.into());
        self.bpp_uri = Some(bpp_uri.into());
        self
    }

    /// The matching callback context: same transaction, fresh message id.
    pub fn reply(&self, action: Action) -> Self {
        Self {
            action,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("context.transaction_id is required".to_string()));
        }
        if self.message_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("context.message_id is required".to_string()));
        }
        if self.bap_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("context.bap_id is required".to_string()));
        }
        Ok(())
    }
}

/// `{ context, message, error? }` wrapper shared by every action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub context: Context,
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransactionError>,
}

impl Envelope {
    pub fn new<M: Serialize>(context: Context, message: &M) -> Result<Self> {
        Ok(Self {
            context,
            message: serde_json::to_value(message)?,
            error: None,
        })
    }

    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::InvalidPayload(format!("invalid envelope: {}", e)))?;
        envelope.context.validate()?;
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn message_as<M: DeserializeOwned>(&self) -> Result<M> {
        serde_json::from_value(self.message.clone()).map_err(|e| {
            ProtocolError::InvalidPayload(format!("invalid {} message: {}", self.context.action, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    pub code: String,
    pub message: String,
}

impl TransactionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub currency: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Catalog snapshot as returned by `on_discover`. Fields the engine does not
/// reason about are kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub items: Vec<CatalogItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Price>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrderSnapshot {
    /// Energy contracted across all items, used as a verification's
    /// expected quantity.
    pub fn total_quantity(&self) -> f64 {
        self.items.iter().filter_map(|item| item.quantity).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogMessage {
    pub catalog: CatalogSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderMessage {
    pub order: OrderSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStartMessage {
    pub order_id: String,
    pub window: VerificationWindow,
    #[serde(default)]
    pub required_proofs: Vec<RequiredProof>,
    pub expected_quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<ToleranceRules>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitProofsMessage {
    pub case_id: String,
    pub proofs: Vec<Proof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDecisionMessage {
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementStartMessage {
    pub case_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<SettlementPeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<SettlementBreakdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCaseMessage {
    pub verification_case: VerificationCase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementMessage {
    pub settlement: Settlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ack,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub status: AckStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub ack: AckBody,
}

/// Synchronous acknowledgement returned for every action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub message: AckMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransactionError>,
}

impl AckResponse {
    pub fn ack() -> Self {
        Self {
            message: AckMessage {
                ack: AckBody { status: AckStatus::Ack },
            },
            error: None,
        }
    }

    pub fn nack(error: TransactionError) -> Self {
        Self {
            message: AckMessage {
                ack: AckBody { status: AckStatus::Nack },
            },
            error: Some(error),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.message.ack.status == AckStatus::Ack
    }
}
