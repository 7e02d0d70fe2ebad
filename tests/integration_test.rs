use beckn_p2p::{
    clock::{ManualTimeSource, TimeSource},
    config::AppConfig,
    database::SqliteBackend,
    engine::{InboundEffect, InboundResult, OutboundRequest, ProtocolEngine},
    error::{ProtocolError, Result},
    keys::{KeyId, KeyPair},
    model::{
        Action, CaseDecisionMessage, CatalogMessage, CatalogSnapshot, Context, Envelope, OrderMessage, OrderSnapshot,
        SettlementMessage, SettlementStartMessage, SubmitProofsMessage, VerificationCaseMessage,
        VerificationStartMessage,
    },
    registry::KeyRegistry,
    settlement::SettlementState,
    signing::{sign_at, SignatureVerifier},
    store::{KvBackend, MemoryBackend},
    transaction::{check_transition, Direction, TransactionStatus, TransactionUpdate, Transition},
    verification::{Proof, ProofType, VerificationState, VerificationWindow},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_test::assert_ok;

const BPP_URI: &str = "http://bpp.example";

fn config(subscriber_id: &str, role: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.identity.subscriber_id = subscriber_id.to_string();
    config.identity.subscriber_uri = format!("http://{}", subscriber_id);
    config.identity.role = role.to_string();
    config
}

fn node(subscriber_id: &str, role: &str, backend: Arc<dyn KvBackend>, clock: Arc<ManualTimeSource>) -> ProtocolEngine {
    ProtocolEngine::from_config(&config(subscriber_id, role), backend, clock).unwrap()
}

fn trust_each_other(a: &ProtocolEngine, b: &ProtocolEngine) {
    a.registry().register(b.key_id().clone(), b.key_pair().verifying_key());
    b.registry().register(a.key_id().clone(), a.key_pair().verifying_key());
}

struct Network {
    clock: Arc<ManualTimeSource>,
    bap: ProtocolEngine,
    bpp: ProtocolEngine,
}

fn network() -> Network {
    let clock = Arc::new(ManualTimeSource::new(chrono::Utc::now()));
    let bap = node("bap.example", "bap", Arc::new(MemoryBackend::with_clock(clock.clone())), clock.clone());
    let bpp = node("bpp.example", "bpp", Arc::new(MemoryBackend::with_clock(clock.clone())), clock.clone());
    trust_each_other(&bap, &bpp);
    Network { clock, bap, bpp }
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

fn order(quantity: f64) -> OrderMessage {
    serde_json::from_value(json!({
        "order": {
            "id": "order-1",
            "provider_id": "prosumer-7",
            "items": [{"id": "solar-kwh", "quantity": quantity}]
        }
    }))
    .unwrap()
}

async fn status(engine: &ProtocolEngine, transaction_id: &str) -> TransactionStatus {
    engine
        .transactions()
        .get_transaction_state(transaction_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

/// Drives one request/callback round and returns the callback as applied by the BAP.
async fn round(net: &Network, request: Action, callback: Action, message: &OrderMessage) -> Result<InboundResult> {
    let outbound = net
        .bap
        .prepare_request(request, "t1", Some(("bpp.example", BPP_URI)), message)
        .await?;
    let received = deliver(&net.bpp, &outbound).await?;
    let reply = net.bpp.prepare_callback(&received.context, callback, message).await?;
    deliver(&net.bap, &reply).await
}

async fn confirmed_network() -> Result<Network> {
    let net = network();

    let discover = net.bap.prepare_request(Action::Discover, "t1", None, &json!({"intent": {"item": "solar-kwh"}})).await?;
    let received = deliver(&net.bpp, &discover).await?;
    let catalog = CatalogMessage {
        catalog: serde_json::from_value(json!({"provider_id": "prosumer-7", "items": [{"id": "solar-kwh", "quantity": 100.0}]}))?,
    };
    let on_discover = net.bpp.prepare_callback(&received.context, Action::OnDiscover, &catalog).await?;
    deliver(&net.bap, &on_discover).await?;

    let order = order(100.0);
    round(&net, Action::Select, Action::OnSelect, &order).await?;
    round(&net, Action::Init, Action::OnInit, &order).await?;
    round(&net, Action::Confirm, Action::OnConfirm, &order).await?;
    Ok(net)
}

#[tokio::test]
async fn test_negotiation_reaches_confirmed_on_both_sides() -> Result<()> {
    let net = confirmed_network().await?;

    let bap_state = net.bap.transactions().get_transaction_state("t1").await?.unwrap();
    assert_eq!(bap_state.status, TransactionStatus::Confirmed);
    assert_eq!(bap_state.catalog.as_ref().map(|c| c.items.len()), Some(1));
    assert_eq!(bap_state.order.as_ref().map(OrderSnapshot::total_quantity), Some(100.0));
    assert!(bap_state.updated_at >= bap_state.created_at);

    assert_eq!(status(&net.bpp, "t1").await, TransactionStatus::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_stale_update_after_confirm_is_rejected() -> Result<()> {
    let net = confirmed_network().await?;

    let err = net
        .bap
        .transactions()
        .update_transaction_state("t1", TransactionUpdate::status(TransactionStatus::Selected))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::IllegalTransition {
            from: TransactionStatus::Confirmed,
            to: TransactionStatus::Selected,
            ..
        }
    ));

    // a late on_select from the provider is refused and its marker released
    let context = Context::new(net.bap.identity().domain.clone(), Action::OnSelect, "bap.example", "http://bap.example", "t1")
        .with_bpp("bpp.example", BPP_URI);
    let message_id = context.message_id.clone();
    let body = Envelope::new(context, &order(100.0))?.to_bytes()?;
    let signed = sign_at(&body, net.bpp.key_pair(), Duration::from_secs(30), net.clock.unix_seconds())?;
    let err = net
        .bap
        .handle_inbound(Some(Action::OnSelect), &signed.authorization_header(), Some(&signed.digest_header()), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::IllegalTransition { .. }));
    assert!(!net.bap.transactions().is_message_processed(&message_id, Direction::Inbound).await?);

    assert_eq!(status(&net.bap, "t1").await, TransactionStatus::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_init_before_select_is_illegal() -> Result<()> {
    let net = network();
    net.bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;

    let err = net
        .bap
        .prepare_request(Action::Init, "t1", None, &order(5.0))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::IllegalTransition { .. }));
    assert_eq!(status(&net.bap, "t1").await, TransactionStatus::Discovering);
    Ok(())
}

#[test]
fn test_status_never_moves_backwards() {
    use TransactionStatus::*;
    let all = [Discovering, Selecting, Selected, Initializing, Initialized, Confirming, Confirmed, Failed];

    for from in all {
        for to in all {
            if check_transition(from, to) == Transition::Advance {
                assert!(to.rank() > from.rank(), "{} -> {} moved backwards", from, to);
            }
        }
    }
    for terminal in [Confirmed, Failed] {
        assert!(all
            .iter()
            .all(|&to| check_transition(terminal, to) != Transition::Advance));
    }
}

#[tokio::test]
async fn test_concurrent_redelivery_applies_once() -> Result<()> {
    let net = network();
    let bpp = Arc::new(net.bpp);
    let discover = net.bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;
    let select = net.bap.prepare_request(Action::Select, "t1", None, &order(10.0)).await?;
    deliver(&bpp, &discover).await?;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let bpp = bpp.clone();
        let select = select.clone();
        handles.push(tokio::spawn(async move { deliver(&bpp, &select).await }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap()?.effect {
            InboundEffect::Transaction(state) => {
                assert_eq!(state.status, TransactionStatus::Selecting);
                applied += 1;
            }
            InboundEffect::Duplicate => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(applied, 1);
    Ok(())
}

#[tokio::test]
async fn test_replay_after_transaction_expiry_is_still_dropped() -> Result<()> {
    let net = network();
    let discover = net.bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;
    deliver(&net.bpp, &discover).await?;

    net.clock.advance(chrono::Duration::hours(25));
    assert!(net.bpp.transactions().get_transaction_state("t1").await?.is_none());
    assert!(net.bpp.transactions().get_all_transaction_states().await?.is_empty());

    // the signature itself is long expired too
    let err = deliver(&net.bpp, &discover).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Expired(_)));

    // a re-signed copy of the same message id is recognised as already processed
    let resigned = sign_at(&discover.body, net.bap.key_pair(), Duration::from_secs(30), net.clock.unix_seconds())?;
    let replay = net
        .bpp
        .handle_inbound(None, &resigned.authorization_header(), None, &discover.body)
        .await?;
    assert_eq!(replay.effect, InboundEffect::Duplicate);
    assert!(net.bpp.transactions().get_transaction_state("t1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_registry_verification_outcomes() -> Result<()> {
    let clock = Arc::new(ManualTimeSource::at_unix(1_780_000_000));
    let registry = KeyRegistry::new(SignatureVerifier::new(clock.clone(), 5));
    let seller = KeyPair::generate(KeyId::new("bpp.example", "key-1"));
    let body = br#"{"context":{},"message":{}}"#;

    let header = sign_at(body, &seller, Duration::from_secs(30), clock.unix_seconds())?.authorization_header();
    assert!(matches!(
        registry.verify_from_registry(&header, body),
        Err(ProtocolError::UnknownKeyId(_))
    ));

    registry.register(seller.key_id().clone(), seller.verifying_key());
    let verified = assert_ok!(registry.verify_from_registry(&header, body));
    assert_eq!(verified.key_id.to_string(), "bpp.example|key-1|ed25519");

    assert!(matches!(
        registry.verify_from_registry(&header, br#"{"context":{},"message":{"x":1}}"#),
        Err(ProtocolError::TamperDetected(_))
    ));

    // thirty second validity plus five seconds of skew
    clock.advance(chrono::Duration::seconds(34));
    assert_ok!(registry.verify_from_registry(&header, body));
    clock.advance(chrono::Duration::seconds(2));
    assert!(matches!(
        registry.verify_from_registry(&header, body),
        Err(ProtocolError::Expired(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_verification_and_settlement_over_the_wire() -> Result<()> {
    let net = confirmed_network().await?;
    let now = net.clock.now();

    // BAP opens verification on the provider
    let start = VerificationStartMessage {
        order_id: "order-1".to_string(),
        window: VerificationWindow {
            start: now,
            end: now + chrono::Duration::hours(1),
        },
        required_proofs: Vec::new(),
        expected_quantity: 100.0,
        tolerance: None,
    };
    let request = net.bap.prepare_request(Action::VerificationStart, "t1", Some(("bpp.example", BPP_URI)), &start).await?;
    let received = deliver(&net.bpp, &request).await?;
    let case = match received.effect {
        InboundEffect::Case(case) => case,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(case.state, VerificationState::Pending);

    let reply = net
        .bpp
        .prepare_callback(&received.context, Action::OnVerificationStart, &VerificationCaseMessage { verification_case: case.clone() })
        .await?;
    deliver(&net.bap, &reply).await?;
    assert_eq!(net.bap.verification().get_case(&case.id).await?.state, VerificationState::Pending);

    // 85 of 100 delivered: outside the default 10% tolerance
    let proofs = SubmitProofsMessage {
        case_id: case.id.clone(),
        proofs: vec![
            Proof::new(ProofType::MeterReading, "meter-1", now + chrono::Duration::minutes(20), 40.0),
            Proof::new(ProofType::MeterReading, "meter-1", now + chrono::Duration::minutes(40), 45.0),
        ],
    };
    let request = net.bap.prepare_request(Action::SubmitProofs, "t1", Some(("bpp.example", BPP_URI)), &proofs).await?;
    match deliver(&net.bpp, &request).await?.effect {
        InboundEffect::Case(case) => {
            assert_eq!(case.state, VerificationState::Deviated);
            assert_eq!(case.delivered_quantity, Some(85.0));
            assert!(!case.deviation.unwrap().within_tolerance);
        }
        other => panic!("unexpected {:?}", other),
    }

    // settlement is refused until the buyer accepts the deviation
    let settle = SettlementStartMessage {
        case_id: case.id.clone(),
        amount: 510.0,
        currency: "INR".to_string(),
        period: None,
        breakdown: None,
    };
    let settle_request = net.bap.prepare_request(Action::SettlementStart, "t1", Some(("bpp.example", BPP_URI)), &settle).await?;
    assert!(matches!(deliver(&net.bpp, &settle_request).await, Err(ProtocolError::CaseNotDecided(_))));

    let accept = CaseDecisionMessage {
        case_id: case.id.clone(),
        reason: None,
    };
    let request = net.bap.prepare_request(Action::AcceptVerification, "t1", Some(("bpp.example", BPP_URI)), &accept).await?;
    deliver(&net.bpp, &request).await?;

    // the refused settlement_start released its marker, so the same message now succeeds
    let settlement = match deliver(&net.bpp, &settle_request).await?.effect {
        InboundEffect::Settlement(settlement) => settlement,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(settlement.state, SettlementState::Initiated);

    net.bpp.verification().mark_settlement_pending(&settlement.id).await?;
    let done = net.bpp.verification().complete_settlement(&settlement.id).await?;

    let reply = net
        .bpp
        .prepare_callback(&received.context, Action::OnSettlementSettled, &SettlementMessage { settlement: done })
        .await?;
    deliver(&net.bap, &reply).await?;
    assert_eq!(
        net.bap.verification().get_settlement(&settlement.id).await?.state,
        SettlementState::Settled
    );
    Ok(())
}

#[tokio::test]
async fn test_markers_survive_restart_on_sqlite() -> Result<()> {
    let temp_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite://{}", temp_file.path().to_string_lossy());
    let clock = Arc::new(ManualTimeSource::new(chrono::Utc::now()));

    let bap = node("bap.example", "bap", Arc::new(MemoryBackend::with_clock(clock.clone())), clock.clone());
    let discover = bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;

    let seed = KeyPair::generate(KeyId::new("bpp.example", "key-1")).seed_base64();
    let open = |clock: Arc<ManualTimeSource>| {
        let db_url = db_url.clone();
        let seed = seed.clone();
        async move {
            let backend = SqliteBackend::with_clock(&db_url, clock.clone()).await?;
            let mut config = config("bpp.example", "bpp");
            config.identity.signing_seed = Some(seed);
            ProtocolEngine::from_config(&config, Arc::new(backend), clock)
        }
    };

    let bpp = open(clock.clone()).await?;
    trust_each_other(&bap, &bpp);
    assert!(matches!(deliver(&bpp, &discover).await?.effect, InboundEffect::Transaction(_)));
    drop(bpp);

    let restarted = open(clock.clone()).await?;
    restarted.registry().register(bap.key_id().clone(), bap.key_pair().verifying_key());
    assert_eq!(deliver(&restarted, &discover).await?.effect, InboundEffect::Duplicate);
    assert_eq!(status(&restarted, "t1").await, TransactionStatus::Discovering);
    Ok(())
}

#[tokio::test]
async fn test_catalog_snapshot_is_kept_verbatim() -> Result<()> {
    let net = network();
    let discover = net.bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;
    let received = deliver(&net.bpp, &discover).await?;

    let catalog: CatalogSnapshot = serde_json::from_value(json!({
        "provider_id": "prosumer-7",
        "items": [{"id": "solar-kwh", "quantity": 12.5, "tariff": {"peak": true}}],
        "fulfillment": "grid-injection"
    }))?;
    let reply = net
        .bpp
        .prepare_callback(&received.context, Action::OnDiscover, &CatalogMessage { catalog: catalog.clone() })
        .await?;
    deliver(&net.bap, &reply).await?;

    let state = net.bap.transactions().get_transaction_state("t1").await?.unwrap();
    assert_eq!(state.status, TransactionStatus::Discovering);
    assert_eq!(state.catalog, Some(catalog));
    Ok(())
}

#[tokio::test]
async fn test_verification_waits_for_confirmed_order() -> Result<()> {
    let net = network();
    let now = net.clock.now();
    let start = VerificationStartMessage {
        order_id: "order-1".to_string(),
        window: VerificationWindow {
            start: now,
            end: now + chrono::Duration::hours(1),
        },
        required_proofs: Vec::new(),
        expected_quantity: 100.0,
        tolerance: None,
    };

    let err = net
        .bap
        .prepare_request(Action::VerificationStart, "t1", Some(("bpp.example", BPP_URI)), &start)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));

    let discover = net.bap.prepare_request(Action::Discover, "t1", None, &json!({})).await?;
    deliver(&net.bpp, &discover).await?;
    let err = net
        .bap
        .prepare_request(Action::VerificationStart, "t1", Some(("bpp.example", BPP_URI)), &start)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::IllegalTransition {
            from: TransactionStatus::Discovering,
            to: TransactionStatus::Confirmed,
            ..
        }
    ));
    assert!(net.bpp.verification().case_for_order("order-1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_rejected_case_is_not_reopened_by_later_callback() -> Result<()> {
    let net = confirmed_network().await?;
    let now = net.clock.now();
    let bpp_target = Some(("bpp.example", BPP_URI));

    let start = VerificationStartMessage {
        order_id: "order-1".to_string(),
        window: VerificationWindow {
            start: now,
            end: now + chrono::Duration::hours(1),
        },
        required_proofs: Vec::new(),
        expected_quantity: 100.0,
        tolerance: None,
    };
    let request = net.bap.prepare_request(Action::VerificationStart, "t1", bpp_target, &start).await?;
    let received = deliver(&net.bpp, &request).await?;
    let case = match received.effect {
        InboundEffect::Case(case) => case,
        other => panic!("unexpected {:?}", other),
    };

    let proofs = SubmitProofsMessage {
        case_id: case.id.clone(),
        proofs: vec![Proof::new(ProofType::MeterReading, "meter-1", now + chrono::Duration::minutes(30), 50.0)],
    };
    let request = net.bap.prepare_request(Action::SubmitProofs, "t1", bpp_target, &proofs).await?;
    deliver(&net.bpp, &request).await?;

    let reject = CaseDecisionMessage {
        case_id: case.id.clone(),
        reason: Some("half the energy never arrived".to_string()),
    };
    let request = net.bap.prepare_request(Action::RejectVerification, "t1", bpp_target, &reject).await?;
    let rejected = match deliver(&net.bpp, &request).await?.effect {
        InboundEffect::Case(case) => case,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(rejected.state, VerificationState::Rejected);

    let reply = net
        .bpp
        .prepare_callback(&received.context, Action::OnVerificationRejected, &VerificationCaseMessage { verification_case: rejected.clone() })
        .await?;
    deliver(&net.bap, &reply).await?;

    // a newer copy claiming the case was verified does not reopen it
    let mut verified = rejected.clone();
    verified.state = VerificationState::Verified;
    verified.decision = None;
    verified.updated_at = rejected.updated_at + chrono::Duration::seconds(5);
    let reply = net
        .bpp
        .prepare_callback(&received.context, Action::OnVerificationAccepted, &VerificationCaseMessage { verification_case: verified })
        .await?;
    match deliver(&net.bap, &reply).await?.effect {
        InboundEffect::Case(kept) => assert_eq!(kept.state, VerificationState::Rejected),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(net.bap.verification().get_case(&case.id).await?.state, VerificationState::Rejected);
    Ok(())
}
