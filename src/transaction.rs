use crate::clock::{SystemTimeSource, TimeSource};
use crate::error::{ProtocolError, Result};
use crate::model::{CatalogSnapshot, OrderSnapshot, TransactionError};
use crate::store::{KeyedLocks, KvBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const STATE_PREFIX: &str = "txn:state:";
const INDEX_KEY: &str = "txn:index";
const MESSAGE_PREFIX: &str = "txn:msg:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Discovering,
    Selecting,
    Selected,
    Initializing,
    Initialized,
    Confirming,
    Confirmed,
    Failed,
}

/// Result of checking a requested status against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    /// Same status, or a lagging status of the current phase: merge only.
    Stay,
    Illegal,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Discovering => "DISCOVERING",
            TransactionStatus::Selecting => "SELECTING",
            TransactionStatus::Selected => "SELECTED",
            TransactionStatus::Initializing => "INITIALIZING",
            TransactionStatus::Initialized => "INITIALIZED",
            TransactionStatus::Confirming => "CONFIRMING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            TransactionStatus::Discovering => 0,
            TransactionStatus::Selecting => 1,
            TransactionStatus::Selected => 2,
            TransactionStatus::Initializing => 3,
            TransactionStatus::Initialized => 4,
            TransactionStatus::Confirming => 5,
            TransactionStatus::Confirmed => 6,
            TransactionStatus::Failed => 7,
        }
    }

    fn phase(self) -> u8 {
        match self {
            TransactionStatus::Discovering => 0,
            TransactionStatus::Selecting | TransactionStatus::Selected => 1,
            TransactionStatus::Initializing | TransactionStatus::Initialized => 2,
            TransactionStatus::Confirming | TransactionStatus::Confirmed => 3,
            TransactionStatus::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Failed)
    }

    /// Statuses a transaction may move from into `self`. Encodes the phase
    /// preconditions: a phase's request or its callback may follow the
    /// completion of the previous phase, never anything earlier.
    fn legal_predecessors(self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Discovering => &[],
            Selecting => &[Discovering],
            Selected => &[Discovering, Selecting],
            Initializing => &[Selected],
            Initialized => &[Selected, Initializing],
            Confirming => &[Initialized],
            Confirmed => &[Initialized, Confirming],
            Failed => &[],
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn check_transition(from: TransactionStatus, to: TransactionStatus) -> Transition {
    if from == to {
        return Transition::Stay;
    }

    if to == TransactionStatus::Failed {
        return if from.is_terminal() {
            Transition::Illegal
        } else {
            Transition::Advance
        };
    }

    if from.phase() == to.phase() && to.rank() < from.rank() {
        return Transition::Stay;
    }

    if to.legal_predecessors().contains(&from) {
        Transition::Advance
    } else {
        Transition::Illegal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransactionError>,
}

impl TransactionState {
    pub fn new(transaction_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: TransactionStatus::Discovering,
            created_at: now,
            updated_at: now,
            catalog: None,
            order: None,
            error: None,
        }
    }

    /// Validates the requested status, then merges the payload fields.
    pub fn apply(&mut self, update: TransactionUpdate, now: DateTime<Utc>) -> Result<Transition> {
        let transition = match update.status {
            Some(to) => check_transition(self.status, to),
            None => Transition::Stay,
        };

        if transition == Transition::Illegal {
            return Err(ProtocolError::IllegalTransition {
                transaction_id: self.transaction_id.clone(),
                from: self.status,
                to: update.status.unwrap_or(self.status),
            });
        }

        if let (Transition::Advance, Some(to)) = (transition, update.status) {
            self.status = to;
        }
        if let Some(catalog) = update.catalog {
            self.catalog = Some(catalog);
        }
        if let Some(order) = update.order {
            self.order = Some(order);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }

        self.updated_at = now.max(self.updated_at).max(self.created_at);
        Ok(transition)
    }
}

/// Partial update merged into a `TransactionState`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub status: Option<TransactionStatus>,
    pub catalog: Option<CatalogSnapshot>,
    pub order: Option<OrderSnapshot>,
    pub error: Option<TransactionError>,
}

impl TransactionUpdate {
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error: TransactionError) -> Self {
        Self {
            status: Some(TransactionStatus::Failed),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_catalog(mut self, catalog: CatalogSnapshot) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_order(mut self, order: OrderSnapshot) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Applied(TransactionState),
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub transaction_ttl: Duration,
    pub message_ttl: Duration,
    pub timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            transaction_ttl: Duration::from_secs(24 * 3600),
            message_ttl: Duration::from_secs(7 * 24 * 3600),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Records live under `txn:state:{id}` with the live ids in `txn:index`.
/// Processed message ids sit under `txn:msg:{direction}:{message_id}` and
/// outlive the record, so a replay is dropped after its transaction expired.
pub struct TransactionStore {
    backend: Arc<dyn KvBackend>,
    settings: StoreSettings,
    clock: Arc<dyn TimeSource>,
    locks: KeyedLocks,
}

fn state_key(transaction_id: &str) -> String {
    format!("{}{}", STATE_PREFIX, transaction_id)
}

fn message_key(message_id: &str, direction: Direction) -> String {
    format!("{}{}:{}", MESSAGE_PREFIX, direction.as_str(), message_id)
}

impl TransactionStore {
    pub fn new(backend: Arc<dyn KvBackend>, settings: StoreSettings) -> Self {
        Self::with_clock(backend, settings, Arc::new(SystemTimeSource))
    }

    pub fn with_clock(backend: Arc<dyn KvBackend>, settings: StoreSettings, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            backend,
            settings,
            clock,
            locks: KeyedLocks::default(),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    async fn timed<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.settings.timeout, op).await?
    }

    async fn load(&self, transaction_id: &str) -> Result<Option<TransactionState>> {
        let raw = self.timed(self.backend.get(&state_key(transaction_id))).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(ProtocolError::from))
            .transpose()
    }

    async fn save(&self, state: &TransactionState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.timed(
            self.backend
                .set(&state_key(&state.transaction_id), &raw, Some(self.settings.transaction_ttl)),
        )
        .await
    }

    pub async fn create_transaction_state(&self, transaction_id: &str) -> Result<TransactionState> {
        let _guard = self.locks.lock(transaction_id).await;
        self.create_locked(transaction_id).await
    }

    async fn create_locked(&self, transaction_id: &str) -> Result<TransactionState> {
        if transaction_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("transaction id cannot be empty".to_string()));
        }

        let state = TransactionState::new(transaction_id, self.clock.now());
        let raw = serde_json::to_string(&state)?;
        let created = self
            .timed(self.backend.set_if_absent(
                &state_key(transaction_id),
                &raw,
                Some(self.settings.transaction_ttl),
            ))
            .await?;

        if !created {
            return Err(ProtocolError::AlreadyExists(transaction_id.to_string()));
        }

        self.timed(self.backend.set_add(INDEX_KEY, transaction_id)).await?;
        tracing::info!(transaction_id, status = %state.status, "Transaction created");
        Ok(state)
    }

    pub async fn update_transaction_state(
        &self,
        transaction_id: &str,
        update: TransactionUpdate,
    ) -> Result<TransactionState> {
        let _guard = self.locks.lock(transaction_id).await;
        self.update_locked(transaction_id, update).await
    }

    async fn update_locked(&self, transaction_id: &str, update: TransactionUpdate) -> Result<TransactionState> {
        let mut state = match self.load(transaction_id).await? {
            Some(state) => state,
            None => {
                self.timed(self.backend.set_remove(INDEX_KEY, transaction_id)).await?;
                return Err(ProtocolError::NotFound(transaction_id.to_string()));
            }
        };

        let previous = state.status;
        let requested = update.status;
        match state.apply(update, self.clock.now()) {
            Ok(transition) => {
                self.save(&state).await?;
                if transition == Transition::Advance {
                    tracing::info!(transaction_id, from = %previous, to = %state.status, "Transaction advanced");
                } else {
                    tracing::debug!(transaction_id, status = %state.status, ?requested, "Transaction merged");
                }
                Ok(state)
            }
            Err(err) => {
                tracing::warn!(transaction_id, from = %previous, ?requested, "Rejected transaction update");
                Err(err)
            }
        }
    }

    pub async fn get_transaction_state(&self, transaction_id: &str) -> Result<Option<TransactionState>> {
        self.load(transaction_id).await
    }

    /// Lists live transactions, pruning ids whose record has expired.
    pub async fn get_all_transaction_states(&self) -> Result<Vec<TransactionState>> {
        let ids = self.timed(self.backend.set_members(INDEX_KEY)).await?;
        let mut states = Vec::with_capacity(ids.len());

        for id in ids {
            match self.load(&id).await? {
                Some(state) => states.push(state),
                None => {
                    tracing::debug!(transaction_id = %id, "Pruning expired transaction from index");
                    self.timed(self.backend.set_remove(INDEX_KEY, &id)).await?;
                }
            }
        }

        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(states)
    }

    pub async fn delete_transaction_state(&self, transaction_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(transaction_id).await;
        let removed = self.timed(self.backend.delete(&state_key(transaction_id))).await?;
        self.timed(self.backend.set_remove(INDEX_KEY, transaction_id)).await?;
        Ok(removed)
    }

    pub async fn is_message_processed(&self, message_id: &str, direction: Direction) -> Result<bool> {
        self.timed(self.backend.exists(&message_key(message_id, direction))).await
    }

    /// Atomic check-and-set. Returns `true` only for the first caller.
    pub async fn mark_message_processed(&self, message_id: &str, direction: Direction) -> Result<bool> {
        self.timed(self.backend.set_if_absent(
            &message_key(message_id, direction),
            "1",
            Some(self.settings.message_ttl),
        ))
        .await
    }

    async fn release_message(&self, message_id: &str, direction: Direction) -> Result<()> {
        self.timed(self.backend.delete(&message_key(message_id, direction)))
            .await
            .map(|_| ())
    }

    /// Runs `work` only for the first delivery of `message_id`. Returns
    /// `None` for a duplicate. If `work` fails the marker is released so a
    /// redelivery can retry.
    pub async fn run_once<T, F>(&self, message_id: &str, work: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.mark_message_processed(message_id, Direction::Inbound).await? {
            tracing::info!(message_id, "Dropping duplicate inbound message");
            return Ok(None);
        }

        match work.await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if let Err(release_err) = self.release_message(message_id, Direction::Inbound).await {
                    tracing::error!(message_id, error = %release_err, "Failed to release message marker");
                }
                Err(err)
            }
        }
    }

    /// Gate plus apply for one inbound message, serialized per transaction.
    /// If applying fails the marker is released so a redelivery can retry.
    pub async fn process_inbound(
        &self,
        message_id: &str,
        transaction_id: &str,
        update: TransactionUpdate,
    ) -> Result<InboundOutcome> {
        self.process_inbound_inner(message_id, transaction_id, update, false).await
    }

    /// Like `process_inbound`, but starts the transaction when this is the
    /// first message seen for it (the provider side of a discover/select).
    pub async fn process_inbound_or_create(
        &self,
        message_id: &str,
        transaction_id: &str,
        update: TransactionUpdate,
    ) -> Result<InboundOutcome> {
        self.process_inbound_inner(message_id, transaction_id, update, true).await
    }

    async fn process_inbound_inner(
        &self,
        message_id: &str,
        transaction_id: &str,
        update: TransactionUpdate,
        create_if_missing: bool,
    ) -> Result<InboundOutcome> {
        let _guard = self.locks.lock(transaction_id).await;

        let applied = self
            .run_once(message_id, async {
                if create_if_missing && self.load(transaction_id).await?.is_none() {
                    self.create_locked(transaction_id).await?;
                }
                self.update_locked(transaction_id, update).await
            })
            .await?;

        Ok(match applied {
            Some(state) => InboundOutcome::Applied(state),
            None => InboundOutcome::Duplicate,
        })
    }
}
