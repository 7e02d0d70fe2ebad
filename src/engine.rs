use crate::{
    clock::TimeSource,
    config::AppConfig,
    error::{ProtocolError, Result},
    keys::{KeyId, KeyPair},
    model::{
        Action, CaseDecisionMessage, CatalogMessage, Context, Envelope, OrderMessage, SettlementMessage,
        SettlementStartMessage, SubmitProofsMessage, TransactionError, VerificationCaseMessage,
        VerificationStartMessage,
    },
    registry::{KeyRegistry, KeyResolver},
    settlement::Settlement,
    signing::{verify_digest_header, SignatureVerifier, Signer},
    store::KvBackend,
    transaction::{
        Direction, InboundOutcome, TransactionState, TransactionStatus, TransactionStore, TransactionUpdate,
    },
    verification::VerificationCase,
    verification_service::VerificationService,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Buyer application: originates requests.
    Bap,
    /// Provider platform: answers with callbacks.
    Bpp,
}

impl Role {
    pub fn parse(role: &str) -> Result<Self> {
        match role {
            "bap" => Ok(Role::Bap),
            "bpp" => Ok(Role::Bpp),
            other => Err(ProtocolError::Config(format!("Unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub subscriber_id: String,
    pub subscriber_uri: String,
    pub role: Role,
    pub domain: String,
}

/// A signed body ready to be POSTed to `{target}/{action}`.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub context: Context,
    pub body: Vec<u8>,
    pub authorization: String,
    pub digest: String,
}

impl OutboundRequest {
    pub fn action(&self) -> Action {
        self.context.action
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEffect {
    Transaction(TransactionState),
    Case(VerificationCase),
    Settlement(Settlement),
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct InboundResult {
    pub context: Context,
    pub sender: KeyId,
    pub effect: InboundEffect,
}

pub struct ProtocolEngine {
    identity: Identity,
    signer: Signer,
    registry: Arc<KeyRegistry>,
    resolver: Option<Arc<dyn KeyResolver>>,
    transactions: Arc<TransactionStore>,
    verification: Arc<VerificationService>,
}

impl ProtocolEngine {
    pub fn new(
        identity: Identity,
        signer: Signer,
        registry: Arc<KeyRegistry>,
        transactions: Arc<TransactionStore>,
        verification: Arc<VerificationService>,
    ) -> Self {
        Self {
            identity,
            signer,
            registry,
            resolver: None,
            transactions,
            verification,
        }
    }

    /// Wires a node from configuration over one shared backend.
    pub fn from_config(config: &AppConfig, backend: Arc<dyn KvBackend>, clock: Arc<dyn TimeSource>) -> Result<Self> {
        let key_id = KeyId::new(config.identity.subscriber_id.clone(), config.identity.unique_key_id.clone());
        let key_pair = match &config.identity.signing_seed {
            Some(seed) => KeyPair::from_base64_seed(key_id, seed)?,
            None => {
                tracing::warn!(key_id = %key_id, "No signing seed configured, generating an ephemeral key");
                KeyPair::generate(key_id)
            }
        };

        let identity = Identity {
            subscriber_id: config.identity.subscriber_id.clone(),
            subscriber_uri: config.identity.subscriber_uri.clone(),
            role: Role::parse(&config.identity.role)?,
            domain: config.identity.domain.clone(),
        };

        let signer = Signer::new(Arc::new(key_pair), config.signature_ttl(), clock.clone());
        let verifier = SignatureVerifier::new(clock.clone(), config.signing.clock_skew_seconds as i64);
        let registry = Arc::new(KeyRegistry::new(verifier));
        // Our own key is always known, which makes loopback and tests simple.
        registry.register(signer.key_id().clone(), signer.key_pair().verifying_key());

        let transactions = Arc::new(TransactionStore::with_clock(
            backend.clone(),
            config.store_settings(),
            clock.clone(),
        ));
        let verification = Arc::new(VerificationService::with_clock(
            backend,
            config.verification_settings(),
            clock,
        ));

        Ok(Self::new(identity, signer, registry, transactions, verification))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key_id(&self) -> &KeyId {
        self.signer.key_id()
    }

    pub fn key_pair(&self) -> &KeyPair {
        self.signer.key_pair()
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn transactions(&self) -> &Arc<TransactionStore> {
        &self.transactions
    }

    pub fn verification(&self) -> &Arc<VerificationService> {
        &self.verification
    }

    /// Builds, records and signs a request this node originates. `counterparty`
    /// is the provider's `(id, uri)` once known.
    pub async fn prepare_request<M: Serialize>(
        &self,
        action: Action,
        transaction_id: &str,
        counterparty: Option<(&str, &str)>,
        message: &M,
    ) -> Result<OutboundRequest> {
        if action.is_callback() {
            return Err(ProtocolError::InvalidPayload(format!("{} is a callback", action)));
        }

        let mut context = Context::new(
            self.identity.domain.clone(),
            action,
            self.identity.subscriber_id.clone(),
            self.identity.subscriber_uri.clone(),
            transaction_id,
        );
        if let Some((bpp_id, bpp_uri)) = counterparty {
            context = context.with_bpp(bpp_id, bpp_uri);
        }

        self.seal(Envelope::new(context, message)?).await
    }

    /// Builds, records and signs the callback answering `request`.
    pub async fn prepare_callback<M: Serialize>(
        &self,
        request: &Context,
        action: Action,
        message: &M,
    ) -> Result<OutboundRequest> {
        let envelope = Envelope::new(self.reply_context(request, action)?, message)?;
        self.seal(envelope).await
    }

    /// A callback carrying an error instead of a result. Moves the
    /// transaction to FAILED for negotiation actions.
    pub async fn prepare_error_callback(
        &self,
        request: &Context,
        action: Action,
        error: TransactionError,
    ) -> Result<OutboundRequest> {
        let mut envelope = Envelope::new(self.reply_context(request, action)?, &serde_json::json!({}))?;
        envelope.error = Some(error);
        self.seal(envelope).await
    }

    fn reply_context(&self, request: &Context, action: Action) -> Result<Context> {
        if !action.is_callback() {
            return Err(ProtocolError::InvalidPayload(format!("{} is not a callback", action)));
        }

        let mut context = request.reply(action);
        if self.identity.role == Role::Bpp {
            context.bpp_id = Some(self.identity.subscriber_id.clone());
            context.bpp_uri = Some(self.identity.subscriber_uri.clone());
        }
        Ok(context)
    }

    async fn seal(&self, envelope: Envelope) -> Result<OutboundRequest> {
        self.record_outbound(&envelope).await?;

        let body = envelope.to_bytes()?;
        let signed = self.signer.sign(&body)?;

        tracing::debug!(
            action = %envelope.context.action,
            transaction_id = %envelope.context.transaction_id,
            message_id = %envelope.context.message_id,
            digest = %signed.digest_fingerprint(),
            "Signed outbound message"
        );

        Ok(OutboundRequest {
            context: envelope.context,
            body,
            authorization: signed.authorization_header(),
            digest: signed.digest_header(),
        })
    }

    async fn record_outbound(&self, envelope: &Envelope) -> Result<()> {
        let context = &envelope.context;
        let action = context.action;

        if action.is_verification() {
            self.ensure_confirmed(&context.transaction_id).await?;
        } else {
            if action == Action::Discover {
                match self.transactions.create_transaction_state(&context.transaction_id).await {
                    Ok(_) | Err(ProtocolError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err),
                }
            } else {
                let update = transaction_update(envelope)?;
                self.transactions
                    .update_transaction_state(&context.transaction_id, update)
                    .await?;
            }
        }

        self.transactions
            .mark_message_processed(&context.message_id, Direction::Outbound)
            .await?;
        Ok(())
    }

    /// Authenticates an inbound body and applies it exactly once.
    ///
    /// Authentication failures surface as `is_auth_failure()` errors; the
    /// transport layer must not forward their detail to the caller.
    pub async fn handle_inbound(
        &self,
        expected_action: Option<Action>,
        authorization: &str,
        digest: Option<&str>,
        body: &[u8],
    ) -> Result<InboundResult> {
        let verified = match &self.resolver {
            Some(resolver) => {
                self.registry
                    .verify_or_resolve(authorization, body, resolver.as_ref())
                    .await?
            }
            None => self.registry.verify_from_registry(authorization, body)?,
        };
        if let Some(digest) = digest {
            verify_digest_header(digest, body)?;
        }

        let envelope = Envelope::from_slice(body)?;
        let context = &envelope.context;
        let action = context.action;

        if expected_action.is_some_and(|expected| expected != action) {
            return Err(ProtocolError::InvalidPayload(format!(
                "context.action {} does not match endpoint",
                action
            )));
        }

        let claimed_sender = if action.is_callback() {
            context.bpp_id.as_deref()
        } else {
            Some(context.bap_id.as_str())
        };
        if claimed_sender != Some(verified.key_id.subscriber_id.as_str()) {
            tracing::warn!(key_id = %verified.key_id, action = %action, "Signer is not the message sender");
            return Err(ProtocolError::TamperDetected(format!(
                "signer {} did not send this {}",
                verified.key_id, action
            )));
        }

        let effect = if action.is_verification() {
            self.ensure_confirmed(&context.transaction_id).await?;
            self.transactions
                .run_once(&context.message_id, self.apply_verification(&envelope))
                .await?
                .unwrap_or(InboundEffect::Duplicate)
        } else {
            let update = transaction_update(&envelope)?;
            let outcome = if matches!(action, Action::Discover | Action::Select) {
                self.transactions
                    .process_inbound_or_create(&context.message_id, &context.transaction_id, update)
                    .await?
            } else {
                self.transactions
                    .process_inbound(&context.message_id, &context.transaction_id, update)
                    .await?
            };
            match outcome {
                InboundOutcome::Applied(state) => InboundEffect::Transaction(state),
                InboundOutcome::Duplicate => InboundEffect::Duplicate,
            }
        };

        tracing::info!(
            action = %action,
            transaction_id = %context.transaction_id,
            message_id = %context.message_id,
            sender = %verified.key_id,
            duplicate = matches!(effect, InboundEffect::Duplicate),
            "Processed inbound message"
        );

        Ok(InboundResult {
            context: envelope.context.clone(),
            sender: verified.key_id,
            effect,
        })
    }

    /// Verification runs only on an order whose negotiation reached CONFIRMED.
    async fn ensure_confirmed(&self, transaction_id: &str) -> Result<()> {
        match self.transactions.get_transaction_state(transaction_id).await? {
            Some(state) if state.status == TransactionStatus::Confirmed => Ok(()),
            Some(state) => Err(ProtocolError::IllegalTransition {
                transaction_id: transaction_id.to_string(),
                from: state.status,
                to: TransactionStatus::Confirmed,
            }),
            None => Err(ProtocolError::NotFound(transaction_id.to_string())),
        }
    }

    async fn apply_verification(&self, envelope: &Envelope) -> Result<InboundEffect> {
        let service = &self.verification;
        let action = envelope.context.action;

        // cases and settlements are hosted by the provider; only a buyer mirrors them
        if action.is_callback() && self.identity.role == Role::Bpp {
            return Err(ProtocolError::InvalidPayload(format!(
                "{} is not accepted by a provider platform",
                action
            )));
        }

        let effect = match action {
            Action::VerificationStart => {
                let request: VerificationStartMessage = envelope.message_as()?;
                InboundEffect::Case(service.start_verification(request).await?)
            }
            Action::SubmitProofs => {
                let request: SubmitProofsMessage = envelope.message_as()?;
                InboundEffect::Case(service.submit_proofs(&request.case_id, request.proofs).await?)
            }
            Action::AcceptVerification => {
                let request: CaseDecisionMessage = envelope.message_as()?;
                InboundEffect::Case(service.accept_verification(&request.case_id).await?)
            }
            Action::RejectVerification => {
                let request: CaseDecisionMessage = envelope.message_as()?;
                let reason = request.reason.as_deref().unwrap_or("rejected by buyer");
                InboundEffect::Case(service.reject_verification(&request.case_id, reason).await?)
            }
            Action::SettlementStart => {
                let request: SettlementStartMessage = envelope.message_as()?;
                InboundEffect::Settlement(service.start_settlement(request).await?)
            }
            Action::OnVerificationStart
            | Action::OnProofsSubmitted
            | Action::OnVerificationAccepted
            | Action::OnVerificationRejected => {
                let update: VerificationCaseMessage = envelope.message_as()?;
                InboundEffect::Case(service.record_case(update.verification_case).await?)
            }
            Action::OnSettlementInitiated
            | Action::OnSettlementPending
            | Action::OnSettlementSettled
            | Action::OnSettlementFailed => {
                let update: SettlementMessage = envelope.message_as()?;
                InboundEffect::Settlement(service.record_settlement(update.settlement).await?)
            }
            other => {
                return Err(ProtocolError::InvalidPayload(format!(
                    "{} is not a verification action",
                    other
                )))
            }
        };
        Ok(effect)
    }
}

/// What a negotiation message does to its transaction record.
fn transaction_update(envelope: &Envelope) -> Result<TransactionUpdate> {
    let action = envelope.context.action;

    if let Some(error) = &envelope.error {
        return Ok(TransactionUpdate::failed(error.clone()));
    }

    let mut update = TransactionUpdate {
        status: action.request_status().or_else(|| action.callback_status()),
        ..TransactionUpdate::default()
    };

    if action == Action::OnDiscover {
        let message: CatalogMessage = envelope.message_as()?;
        update.catalog = Some(message.catalog);
    } else if envelope.message.get("order").is_some() {
        let message: OrderMessage = envelope.message_as()?;
        update.order = Some(message.order);
    }

    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::model::{OrderSnapshot, TransactionError};
    use crate::store::MemoryBackend;
    use crate::verification::VerificationWindow;
    use serde_json::json;

    fn node(subscriber_id: &str, role: &str, clock: Arc<ManualTimeSource>) -> ProtocolEngine {
        let mut config = AppConfig::default();
        config.identity.subscriber_id = subscriber_id.to_string();
        config.identity.subscriber_uri = format!("http://{}", subscriber_id);
        config.identity.role = role.to_string();
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        ProtocolEngine::from_config(&config, backend, clock).unwrap()
    }

    fn pair() -> (ProtocolEngine, ProtocolEngine) {
        let clock = Arc::new(ManualTimeSource::new(chrono::Utc::now()));
        let bap = node("bap.example", "bap", clock.clone());
        let bpp = node("bpp.example", "bpp", clock);
        bap.registry().register(bpp.key_id().clone(), bpp.key_pair().verifying_key());
        bpp.registry().register(bap.key_id().clone(), bap.key_pair().verifying_key());
        (bap, bpp)
    }

    async fn deliver(to: &ProtocolEngine, request: &OutboundRequest) -> Result<InboundResult> {
        to.handle_inbound(
            Some(request.action()),
            &request.authorization,
            Some(&request.digest),
            &request.body,
        )
        .await
    }

    fn status_of(result: &InboundResult) -> TransactionStatus {
        match &result.effect {
            InboundEffect::Transaction(state) => state.status,
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_select_round_trip() {
        let (bap, bpp) = pair();

        let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({"intent": {}})).await.unwrap();
        assert_eq!(status_of(&deliver(&bpp, &discover).await.unwrap()), TransactionStatus::Discovering);

        let select = bap
            .prepare_request(Action::Select, "t1", Some(("bpp.example", "http://bpp.example")), &json!({"order": {"items": [{"id": "e1", "quantity": 5.0}]}}))
            .await
            .unwrap();
        let state = bap.transactions().get_transaction_state("t1").await.unwrap().unwrap();
        assert_eq!(state.status, TransactionStatus::Selecting);

        let received = deliver(&bpp, &select).await.unwrap();
        assert_eq!(status_of(&received), TransactionStatus::Selecting);

        let on_select = bpp
            .prepare_callback(&received.context, Action::OnSelect, &OrderMessage { order: OrderSnapshot::default() })
            .await
            .unwrap();
        assert_eq!(on_select.context.bpp_id.as_deref(), Some("bpp.example"));

        let applied = deliver(&bap, &on_select).await.unwrap();
        assert_eq!(status_of(&applied), TransactionStatus::Selected);
        assert_eq!(applied.sender, *bpp.key_id());
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let (bap, bpp) = pair();
        let select = bap.prepare_request(Action::Select, "t1", None, &json!({})).await.unwrap_err();
        assert!(matches!(select, ProtocolError::NotFound(_)));

        let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({})).await.unwrap();
        deliver(&bpp, &discover).await.unwrap();
        let again = deliver(&bpp, &discover).await.unwrap();
        assert_eq!(again.effect, InboundEffect::Duplicate);
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let (bap, bpp) = pair();
        let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({})).await.unwrap();

        let mut body = discover.body.clone();
        let last = body.len() - 2;
        body[last] = b' ';
        let err = bpp
            .handle_inbound(None, &discover.authorization, None, &body)
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
        assert!(bpp.transactions().get_transaction_state("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signer_must_be_sender() {
        let (bap, bpp) = pair();
        // bpp signs a request that claims to come from bap
        let mut context = Context::new("energy:p2p-trading", Action::Discover, "bap.example", "http://bap.example", "t1");
        context.bpp_id = Some("bpp.example".to_string());
        let envelope = Envelope::new(context, &json!({})).unwrap();
        let forged = bpp.seal(envelope).await.unwrap();

        let err = deliver(&bap, &forged).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TamperDetected(_)));
    }

    #[tokio::test]
    async fn test_endpoint_action_must_match() {
        let (bap, bpp) = pair();
        let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({})).await.unwrap();
        let err = bpp
            .handle_inbound(Some(Action::Select), &discover.authorization, None, &discover.body)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_error_callback_fails_transaction() {
        let (bap, bpp) = pair();
        let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({})).await.unwrap();
        let select = bap.prepare_request(Action::Select, "t1", None, &json!({})).await.unwrap();
        deliver(&bpp, &discover).await.unwrap();
        let received = deliver(&bpp, &select).await.unwrap();

        let nack = bpp
            .prepare_error_callback(&received.context, Action::OnSelect, TransactionError::new("40002", "out of stock"))
            .await
            .unwrap();
        assert_eq!(
            bpp.transactions().get_transaction_state("t1").await.unwrap().unwrap().status,
            TransactionStatus::Failed
        );

        let applied = deliver(&bap, &nack).await.unwrap();
        match applied.effect {
            InboundEffect::Transaction(state) => {
                assert_eq!(state.status, TransactionStatus::Failed);
                assert_eq!(state.error.unwrap().code, "40002");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Signs `message` as `engine` without recording anything locally.
    fn signed<M: Serialize>(engine: &ProtocolEngine, context: Context, message: &M) -> OutboundRequest {
        let body = Envelope::new(context.clone(), message).unwrap().to_bytes().unwrap();
        let signature = engine.signer.sign(&body).unwrap();
        OutboundRequest {
            context,
            body,
            authorization: signature.authorization_header(),
            digest: signature.digest_header(),
        }
    }

    async fn confirm(engine: &ProtocolEngine, transaction_id: &str) {
        let store = engine.transactions();
        store.create_transaction_state(transaction_id).await.unwrap();
        for status in [TransactionStatus::Selected, TransactionStatus::Initialized, TransactionStatus::Confirmed] {
            store
                .update_transaction_state(transaction_id, TransactionUpdate::status(status))
                .await
                .unwrap();
        }
    }

    fn verification_start(order_id: &str) -> VerificationStartMessage {
        let now = chrono::Utc::now();
        VerificationStartMessage {
            order_id: order_id.to_string(),
            window: VerificationWindow {
                start: now,
                end: now + chrono::Duration::hours(1),
            },
            required_proofs: Vec::new(),
            expected_quantity: 100.0,
            tolerance: None,
        }
    }

    #[tokio::test]
    async fn test_verification_needs_confirmed_transaction() {
        let (bap, bpp) = pair();

        let err = bap
            .prepare_request(Action::VerificationStart, "never-negotiated", None, &verification_start("o1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(_)));

        bap.prepare_request(Action::Discover, "t1", None, &json!({})).await.unwrap();
        let err = bap
            .prepare_request(Action::VerificationStart, "t1", None, &verification_start("o1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IllegalTransition {
                from: TransactionStatus::Discovering,
                ..
            }
        ));

        // the provider refuses it too, and does not burn the message id
        let context = Context::new("energy:p2p-trading", Action::VerificationStart, "bap.example", "http://bap.example", "never-negotiated");
        let message_id = context.message_id.clone();
        let request = signed(&bap, context, &verification_start("o1"));
        let err = deliver(&bpp, &request).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(_)));
        assert!(bpp.verification().case_for_order("o1").await.unwrap().is_none());
        assert!(!bpp.transactions().is_message_processed(&message_id, Direction::Inbound).await.unwrap());

        confirm(&bpp, "never-negotiated").await;
        match deliver(&bpp, &request).await.unwrap().effect {
            InboundEffect::Case(case) => assert_eq!(case.order_id, "o1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_refuses_case_mirror() {
        let (_bap, bpp) = pair();
        confirm(&bpp, "t1").await;

        let case = bpp.verification().start_verification(verification_start("o1")).await.unwrap();
        let mut forged = case.clone();
        forged.state = crate::verification::VerificationState::Verified;
        forged.updated_at = case.updated_at + chrono::Duration::seconds(1);

        let context = Context::new("energy:p2p-trading", Action::OnVerificationAccepted, "bap.example", "http://bap.example", "t1")
            .with_bpp("bpp.example", "http://bpp.example");
        let request = signed(&bpp, context, &VerificationCaseMessage { verification_case: forged });
        let err = deliver(&bpp, &request).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));

        let stored = bpp.verification().get_case(&case.id).await.unwrap();
        assert_eq!(stored.state, crate::verification::VerificationState::Pending);
    }

    #[test]
    fn test_catalog_update_from_on_discover() {
        let context = Context::new("energy:p2p-trading", Action::OnDiscover, "bap", "http://bap", "t1");
        let envelope = Envelope::new(
            context,
            &json!({"catalog": {"provider_id": "p1", "items": [{"id": "e1", "quantity": 10.0}]}}),
        )
        .unwrap();

        let update = transaction_update(&envelope).unwrap();
        assert_eq!(update.status, None);
        assert_eq!(update.catalog.unwrap().items[0].id, "e1");
    }
}
