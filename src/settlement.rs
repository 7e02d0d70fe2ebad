use crate::error::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Initiated,
    Pending,
    Settled,
    Failed,
}

impl SettlementState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SettlementState::Settled | SettlementState::Failed)
    }

    fn can_move_to(self, to: SettlementState) -> bool {
        matches!(
            (self, to),
            (SettlementState::Initiated, SettlementState::Pending)
                | (SettlementState::Initiated, SettlementState::Failed)
                | (SettlementState::Pending, SettlementState::Settled)
                | (SettlementState::Pending, SettlementState::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// How the settled amount was arrived at. Free-form beyond the energy line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettlementBreakdown {
    #[serde(default)]
    pub energy_amount: f64,
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub penalties: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SettlementBreakdown {
    pub fn total(&self) -> f64 {
        self.energy_amount + self.fees - self.penalties
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: String,
    pub order_id: String,
    pub case_id: String,
    pub state: SettlementState,
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<SettlementPeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<SettlementBreakdown>,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Settlement {
    pub fn new(
        order_id: impl Into<String>,
        case_id: impl Into<String>,
        amount: f64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(ProtocolError::InvalidPayload(format!(
                "settlement amount must be a non-negative number, got {}",
                amount
            )));
        }
        let currency = currency.into();
        if currency.is_empty() {
            return Err(ProtocolError::InvalidPayload("settlement currency is required".to_string()));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            case_id: case_id.into(),
            state: SettlementState::Initiated,
            amount,
            currency,
            period: None,
            breakdown: None,
            initiated_at: now,
            completed_at: None,
            reason: None,
        })
    }

    pub fn with_period(mut self, period: Option<SettlementPeriod>) -> Self {
        self.period = period;
        self
    }

    pub fn with_breakdown(mut self, breakdown: Option<SettlementBreakdown>) -> Self {
        self.breakdown = breakdown;
        self
    }

    fn move_to(&mut self, to: SettlementState) -> Result<()> {
        if !self.state.can_move_to(to) {
            return Err(ProtocolError::IllegalSettlementTransition {
                settlement_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn mark_pending(&mut self) -> Result<()> {
        self.move_to(SettlementState::Pending)
    }

    pub fn mark_settled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.move_to(SettlementState::Settled)?;
        self.completed_at = Some(now);
        tracing::info!(settlement_id = %self.id, amount = self.amount, currency = %self.currency, "Settlement completed");
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.move_to(SettlementState::Failed)?;
        self.completed_at = Some(now);
        self.reason = Some(reason.into());
        tracing::warn!(settlement_id = %self.id, reason = ?self.reason, "Settlement failed");
        Ok(())
    }
}
