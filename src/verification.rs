//! Delivery verification for confirmed orders.
//!
//! A case collects proofs of delivered energy, compares the delivered total
//! against the contracted quantity and lands in a decision state:
//!
//! ```text
//! PENDING -> PROOFS_RECEIVED -> VERIFYING -> VERIFIED | DEVIATED
//!                   \_____________________________/
//!                    REJECTED | DISPUTED | FAILED | TIMEOUT
//! ```
//!
//! The aggregation and deviation functions are pure; the case methods take
//! `now` explicitly so timeout handling stays deterministic.

use crate::error::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofType {
    MeterReading,
    Telemetry,
    Attestation,
    Otp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: ProofType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Proof {
    pub fn new(proof_type: ProofType, source: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            proof_type,
            source: source.into(),
            timestamp,
            value,
            metadata: Map::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.value.is_finite() || self.value < 0.0 {
            return Err(ProtocolError::InvalidPayload(format!(
                "proof from {} has invalid value {}",
                self.source, self.value
            )));
        }
        if self.source.is_empty() {
            return Err(ProtocolError::InvalidPayload("proof source is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredProof {
    #[serde(rename = "type")]
    pub proof_type: ProofType,
    pub source: String,
    pub deadline: DateTime<Utc>,
}

impl RequiredProof {
    /// An empty required source accepts any source.
    fn is_satisfied_by(&self, proof: &Proof) -> bool {
        proof.proof_type == self.proof_type
            && (self.source.is_empty() || self.source == proof.source)
            && proof.timestamp <= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceRules {
    pub max_deviation_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quantity: Option<f64>,
}

impl ToleranceRules {
    pub fn validate(&self) -> Result<()> {
        if !self.max_deviation_percent.is_finite() || self.max_deviation_percent < 0.0 {
            return Err(ProtocolError::InvalidTolerance(format!(
                "max deviation percent must be a non-negative number, got {}",
                self.max_deviation_percent
            )));
        }
        if let Some(min) = self.min_quantity {
            if !min.is_finite() || min < 0.0 {
                return Err(ProtocolError::InvalidTolerance(format!(
                    "min quantity must be a non-negative number, got {}",
                    min
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    /// `expected - delivered`; negative means over-delivery.
    pub quantity: f64,
    pub percent: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationState {
    Pending,
    ProofsReceived,
    Verifying,
    Verified,
    Deviated,
    Rejected,
    Disputed,
    Failed,
    Timeout,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerificationState::Verified
                | VerificationState::Rejected
                | VerificationState::Disputed
                | VerificationState::Failed
                | VerificationState::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accepted,
    Rejected,
    Disputed,
}

/// Sums every proof's value. All proof types count the same way.
pub fn calculate_delivered_quantity(proofs: &[Proof]) -> f64 {
    proofs.iter().map(|proof| proof.value).sum()
}

pub fn calculate_deviation(expected: f64, delivered: f64, tolerance: &ToleranceRules) -> Result<Deviation> {
    tolerance.validate()?;

    if !expected.is_finite() || expected <= 0.0 {
        return Err(ProtocolError::InvalidTolerance(format!(
            "expected quantity must be positive, got {}",
            expected
        )));
    }
    if !delivered.is_finite() {
        return Err(ProtocolError::InvalidTolerance(format!(
            "delivered quantity must be finite, got {}",
            delivered
        )));
    }

    let quantity = expected - delivered;
    let percent = quantity.abs() / expected * 100.0;
    let meets_minimum = tolerance.min_quantity.map_or(true, |min| delivered >= min);

    Ok(Deviation {
        quantity,
        percent,
        within_tolerance: percent <= tolerance.max_deviation_percent && meets_minimum,
    })
}

pub fn determine_verification_state(deviation: &Deviation, proofs_received: bool) -> VerificationState {
    if !proofs_received {
        VerificationState::Pending
    } else if deviation.within_tolerance {
        VerificationState::Verified
    } else {
        VerificationState::Deviated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCase {
    pub id: String,
    pub order_id: String,
    pub state: VerificationState,
    pub window: VerificationWindow,
    pub required_proofs: Vec<RequiredProof>,
    pub expected_quantity: f64,
    pub tolerance: ToleranceRules,
    #[serde(default)]
    pub proofs: Vec<Proof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<Deviation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationCase {
    pub fn new(
        order_id: impl Into<String>,
        window: VerificationWindow,
        required_proofs: Vec<RequiredProof>,
        expected_quantity: f64,
        tolerance: ToleranceRules,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        tolerance.validate()?;
        if !expected_quantity.is_finite() || expected_quantity <= 0.0 {
            return Err(ProtocolError::InvalidTolerance(format!(
                "expected quantity must be positive, got {}",
                expected_quantity
            )));
        }
        if window.end <= window.start {
            return Err(ProtocolError::InvalidPayload("verification window must end after it starts".to_string()));
        }

        let order_id = order_id.into();
        if order_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("order id is required".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            order_id,
            state: VerificationState::Pending,
            window,
            required_proofs,
            expected_quantity,
            tolerance,
            proofs: Vec::new(),
            delivered_quantity: None,
            deviation: None,
            decision: None,
            reason: None,
            created_at: now,
            updated_at: now,
            expires_at: expires_at.max(window.end),
        })
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_terminal() || self.decision.is_some() {
            return Err(ProtocolError::AlreadyDecided(format!(
                "case {} is {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn ensure_proofs(&self) -> Result<()> {
        if self.proofs.is_empty() {
            return Err(ProtocolError::CaseNotDecided(format!("case {} has no proofs yet", self.id)));
        }
        Ok(())
    }

    /// Lazily moves a lapsed, undecided case to TIMEOUT. Returns whether the
    /// state changed.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || now <= self.expires_at {
            return false;
        }
        self.state = VerificationState::Timeout;
        self.reason = Some("verification window lapsed".to_string());
        self.touch(now);
        true
    }

    pub fn requirements_satisfied(&self) -> bool {
        self.required_proofs
            .iter()
            .all(|required| self.proofs.iter().any(|proof| required.is_satisfied_by(proof)))
    }

    pub fn submit_proofs(&mut self, proofs: Vec<Proof>, now: DateTime<Utc>) -> Result<VerificationState> {
        self.check_timeout(now);
        self.ensure_open()?;

        if proofs.is_empty() {
            return Err(ProtocolError::InvalidPayload("at least one proof is required".to_string()));
        }
        for proof in &proofs {
            proof.validate()?;
        }

        // staged on a copy so a failed evaluation leaves the case untouched
        let mut staged = self.clone();
        staged.proofs.extend(proofs);
        staged.proofs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        staged.state = VerificationState::ProofsReceived;
        staged.touch(now);

        if staged.requirements_satisfied() {
            staged.evaluate(now)?;
        }
        *self = staged;
        Ok(self.state)
    }

    /// Aggregates the collected proofs and records the outcome. On error the
    /// case is left as it was.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Result<VerificationState> {
        self.ensure_open()?;
        self.ensure_proofs()?;

        let delivered = calculate_delivered_quantity(&self.proofs);
        let deviation = calculate_deviation(self.expected_quantity, delivered, &self.tolerance)?;

        self.state = VerificationState::Verifying;
        self.delivered_quantity = Some(delivered);
        self.deviation = Some(deviation);
        self.state = determine_verification_state(&deviation, true);
        self.touch(now);
        Ok(self.state)
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_timeout(now);
        if self.decision.is_some() {
            return Err(ProtocolError::AlreadyDecided(format!("case {} already has a decision", self.id)));
        }

        match self.state {
            VerificationState::Verified | VerificationState::Deviated => {
                self.state = VerificationState::Verified;
                self.decision = Some(Decision::Accepted);
                self.touch(now);
                Ok(())
            }
            state if state.is_terminal() => Err(ProtocolError::AlreadyDecided(format!(
                "case {} is {:?}",
                self.id, state
            ))),
            _ => Err(ProtocolError::CaseNotDecided(format!(
                "case {} has no verification result yet",
                self.id
            ))),
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.check_timeout(now);
        self.ensure_open()?;
        self.ensure_proofs()?;

        self.state = VerificationState::Rejected;
        self.decision = Some(Decision::Rejected);
        self.reason = Some(reason.into());
        self.touch(now);
        Ok(())
    }

    pub fn dispute(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.check_timeout(now);
        self.ensure_open()?;
        self.ensure_proofs()?;

        self.state = VerificationState::Disputed;
        self.decision = Some(Decision::Disputed);
        self.reason = Some(reason.into());
        self.touch(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;

        self.state = VerificationState::Failed;
        self.reason = Some(reason.into());
        self.touch(now);
        Ok(())
    }

    pub fn is_settleable(&self) -> bool {
        self.state == VerificationState::Verified
    }
}
