use crate::clock::{SystemTimeSource, TimeSource};
use crate::error::{ProtocolError, Result};
use crate::model::{SettlementStartMessage, VerificationStartMessage};
use crate::settlement::{Settlement, SettlementState};
use crate::store::{KeyedLocks, KvBackend};
use crate::verification::{Proof, ToleranceRules, VerificationCase};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const CASE_PREFIX: &str = "verification:case:";
const ORDER_PREFIX: &str = "verification:order:";
const SETTLEMENT_PREFIX: &str = "settlement:";
const SETTLEMENT_CASE_PREFIX: &str = "settlement:case:";

#[derive(Debug, Clone, Copy)]
pub struct VerificationSettings {
    pub record_ttl: Duration,
    /// Added to the window end to get a case's expiry.
    pub grace: chrono::Duration,
    pub default_tolerance: ToleranceRules,
    pub timeout: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(7 * 24 * 3600),
            grace: chrono::Duration::hours(24),
            default_tolerance: ToleranceRules {
                max_deviation_percent: 10.0,
                min_quantity: None,
            },
            timeout: Duration::from_secs(2),
        }
    }
}

fn case_key(case_id: &str) -> String {
    format!("{}{}", CASE_PREFIX, case_id)
}

fn order_key(order_id: &str) -> String {
    format!("{}{}", ORDER_PREFIX, order_id)
}

fn settlement_key(settlement_id: &str) -> String {
    format!("{}{}", SETTLEMENT_PREFIX, settlement_id)
}

fn settlement_case_key(case_id: &str) -> String {
    format!("{}{}", SETTLEMENT_CASE_PREFIX, case_id)
}

/// Cases and settlements on the shared backend. Mutations run under a
/// per-case lock; a case read after its window lapsed comes back as TIMEOUT.
pub struct VerificationService {
    backend: Arc<dyn KvBackend>,
    settings: VerificationSettings,
    clock: Arc<dyn TimeSource>,
    locks: KeyedLocks,
}

impl VerificationService {
    pub fn new(backend: Arc<dyn KvBackend>, settings: VerificationSettings) -> Self {
        Self::with_clock(backend, settings, Arc::new(SystemTimeSource))
    }

    pub fn with_clock(
        backend: Arc<dyn KvBackend>,
        settings: VerificationSettings,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            backend,
            settings,
            clock,
            locks: KeyedLocks::default(),
        }
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    async fn timed<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.settings.timeout, op).await?
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.timed(self.backend.get(key)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(ProtocolError::from))
            .transpose()
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.timed(self.backend.set(key, &raw, Some(self.settings.record_ttl)))
            .await
    }

    /// Loads a case and applies the lazy timeout. Caller holds the case lock.
    async fn load_case(&self, case_id: &str) -> Result<VerificationCase> {
        let mut case: VerificationCase = self
            .read(&case_key(case_id))
            .await?
            .ok_or_else(|| ProtocolError::CaseNotFound(case_id.to_string()))?;

        if case.check_timeout(self.clock.now()) {
            tracing::info!(case_id, order_id = %case.order_id, "Verification case timed out");
            self.write(&case_key(case_id), &case).await?;
        }
        Ok(case)
    }

    async fn mutate_case<F>(&self, case_id: &str, mutate: F) -> Result<VerificationCase>
    where
        F: FnOnce(&mut VerificationCase) -> Result<()>,
    {
        let _guard = self.locks.lock(&case_key(case_id)).await;
        let mut case = self.load_case(case_id).await?;
        let previous = case.state;

        mutate(&mut case)?;

        self.write(&case_key(case_id), &case).await?;
        tracing::info!(case_id, from = ?previous, to = ?case.state, "Verification case updated");
        Ok(case)
    }

    /// Opens a case for an order. A live case for the same order is returned
    /// as is, so a redelivered start does not fork the verification.
    pub async fn start_verification(&self, request: VerificationStartMessage) -> Result<VerificationCase> {
        let tolerance = request.tolerance.unwrap_or(self.settings.default_tolerance);
        let now = self.clock.now();
        let expires_at = request.window.end + self.settings.grace;

        let _order_guard = self.locks.lock(&order_key(&request.order_id)).await;

        if let Some(existing) = self.case_for_order(&request.order_id).await? {
            if !existing.state.is_terminal() {
                tracing::info!(order_id = %request.order_id, case_id = %existing.id, "Verification already open for order");
                return Ok(existing);
            }
        }

        let case = VerificationCase::new(
            request.order_id,
            request.window,
            request.required_proofs,
            request.expected_quantity,
            tolerance,
            expires_at,
            now,
        )?;

        self.write(&case_key(&case.id), &case).await?;
        self.timed(self.backend.set(
            &order_key(&case.order_id),
            &case.id,
            Some(self.settings.record_ttl),
        ))
        .await?;

        tracing::info!(case_id = %case.id, order_id = %case.order_id, expected = case.expected_quantity, "Verification started");
        Ok(case)
    }

    pub async fn get_case(&self, case_id: &str) -> Result<VerificationCase> {
        let _guard = self.locks.lock(&case_key(case_id)).await;
        self.load_case(case_id).await
    }

    pub async fn case_for_order(&self, order_id: &str) -> Result<Option<VerificationCase>> {
        let case_id = match self.timed(self.backend.get(&order_key(order_id))).await? {
            Some(case_id) => case_id,
            None => return Ok(None),
        };

        match self.get_case(&case_id).await {
            Ok(case) => Ok(Some(case)),
            Err(ProtocolError::CaseNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn submit_proofs(&self, case_id: &str, proofs: Vec<Proof>) -> Result<VerificationCase> {
        let now = self.clock.now();
        let count = proofs.len();
        let case = self
            .mutate_case(case_id, |case| case.submit_proofs(proofs, now).map(|_| ()))
            .await?;

        tracing::debug!(case_id, proofs = count, delivered = ?case.delivered_quantity, "Proofs recorded");
        Ok(case)
    }

    pub async fn accept_verification(&self, case_id: &str) -> Result<VerificationCase> {
        let now = self.clock.now();
        self.mutate_case(case_id, |case| case.accept(now)).await
    }

    pub async fn reject_verification(&self, case_id: &str, reason: &str) -> Result<VerificationCase> {
        let now = self.clock.now();
        self.mutate_case(case_id, |case| case.reject(reason, now)).await
    }

    pub async fn dispute_verification(&self, case_id: &str, reason: &str) -> Result<VerificationCase> {
        let now = self.clock.now();
        self.mutate_case(case_id, |case| case.dispute(reason, now)).await
    }

    pub async fn fail_verification(&self, case_id: &str, reason: &str) -> Result<VerificationCase> {
        let now = self.clock.now();
        self.mutate_case(case_id, |case| case.fail(reason, now)).await
    }

    /// Stores a counterparty's view of a case, keeping the newer copy. A
    /// case that is already terminal here is never overwritten.
    pub async fn record_case(&self, case: VerificationCase) -> Result<VerificationCase> {
        let _guard = self.locks.lock(&case_key(&case.id)).await;

        if let Some(current) = self.read::<VerificationCase>(&case_key(&case.id)).await? {
            if current.state.is_terminal() {
                tracing::warn!(case_id = %case.id, state = ?current.state, offered = ?case.state, "Ignoring update to a decided case");
                return Ok(current);
            }
            if current.updated_at > case.updated_at {
                tracing::debug!(case_id = %case.id, "Ignoring stale verification case");
                return Ok(current);
            }
        }

        self.write(&case_key(&case.id), &case).await?;
        self.timed(self.backend.set(
            &order_key(&case.order_id),
            &case.id,
            Some(self.settings.record_ttl),
        ))
        .await?;
        Ok(case)
    }

    /// Opens a settlement for a VERIFIED case. At most one settlement per
    /// case is live; a failed one may be replaced.
    pub async fn start_settlement(&self, request: SettlementStartMessage) -> Result<Settlement> {
        let _guard = self.locks.lock(&case_key(&request.case_id)).await;
        let case = self.load_case(&request.case_id).await?;

        if !case.is_settleable() {
            return Err(ProtocolError::CaseNotDecided(format!(
                "case {} is {:?}, settlement needs VERIFIED",
                case.id, case.state
            )));
        }

        if let Some(existing) = self.settlement_for_case(&case.id).await? {
            if existing.state != SettlementState::Failed {
                return Err(ProtocolError::AlreadyDecided(format!(
                    "case {} already has settlement {}",
                    case.id, existing.id
                )));
            }
        }

        let settlement = Settlement::new(
            case.order_id.clone(),
            case.id.clone(),
            request.amount,
            request.currency,
            self.clock.now(),
        )?
        .with_period(request.period)
        .with_breakdown(request.breakdown);

        self.write(&settlement_key(&settlement.id), &settlement).await?;
        self.timed(self.backend.set(
            &settlement_case_key(&case.id),
            &settlement.id,
            Some(self.settings.record_ttl),
        ))
        .await?;

        tracing::info!(
            settlement_id = %settlement.id,
            case_id = %case.id,
            amount = settlement.amount,
            currency = %settlement.currency,
            "Settlement initiated"
        );
        Ok(settlement)
    }

    pub async fn get_settlement(&self, settlement_id: &str) -> Result<Settlement> {
        self.read(&settlement_key(settlement_id))
            .await?
            .ok_or_else(|| ProtocolError::SettlementNotFound(settlement_id.to_string()))
    }

    pub async fn settlement_for_case(&self, case_id: &str) -> Result<Option<Settlement>> {
        match self.timed(self.backend.get(&settlement_case_key(case_id))).await? {
            Some(settlement_id) => self.read(&settlement_key(&settlement_id)).await,
            None => Ok(None),
        }
    }

    async fn mutate_settlement<F>(&self, settlement_id: &str, mutate: F) -> Result<Settlement>
    where
        F: FnOnce(&mut Settlement) -> Result<()>,
    {
        let _guard = self.locks.lock(&settlement_key(settlement_id)).await;
        let mut settlement = self.get_settlement(settlement_id).await?;
        mutate(&mut settlement)?;
        self.write(&settlement_key(settlement_id), &settlement).await?;
        Ok(settlement)
    }

    pub async fn mark_settlement_pending(&self, settlement_id: &str) -> Result<Settlement> {
        self.mutate_settlement(settlement_id, |s| s.mark_pending()).await
    }

    pub async fn complete_settlement(&self, settlement_id: &str) -> Result<Settlement> {
        let now = self.clock.now();
        self.mutate_settlement(settlement_id, |s| s.mark_settled(now)).await
    }

    pub async fn fail_settlement(&self, settlement_id: &str, reason: &str) -> Result<Settlement> {
        let now = self.clock.now();
        self.mutate_settlement(settlement_id, |s| s.mark_failed(reason, now)).await
    }

    /// Stores a counterparty's view of a settlement. Terminal copies are
    /// never overwritten.
    pub async fn record_settlement(&self, settlement: Settlement) -> Result<Settlement> {
        let _guard = self.locks.lock(&settlement_key(&settlement.id)).await;

        if let Some(current) = self.read::<Settlement>(&settlement_key(&settlement.id)).await? {
            if current.state.is_terminal() {
                return Ok(current);
            }
        }

        self.write(&settlement_key(&settlement.id), &settlement).await?;
        self.timed(self.backend.set(
            &settlement_case_key(&settlement.case_id),
            &settlement.id,
            Some(self.settings.record_ttl),
        ))
        .await?;
        Ok(settlement)
    }
}
