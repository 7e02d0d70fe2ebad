//! # beckn-p2p - Beckn protocol engine for peer-to-peer energy trading
//!
//! Everything a buyer application (BAP) or provider platform (BPP) needs to
//! take part in a signed, asynchronous request/callback exchange.
//!
//! ## Architecture
//!
//! - **Signing**: Ed25519 over a SHA-512 body digest, carried in an HTTP
//!   `Authorization: Signature ...` header with a bounded validity window
//! - **Key registry**: key ids (`subscriber|key|ed25519`) to public keys, filled
//!   locally or resolved from a network registry
//! - **Transaction store**: TTL-bound negotiation records and a per-direction
//!   processed-message index on a pluggable key/value backend (memory, SQLite)
//! - **State machine**: monotone `DISCOVERING` .. `CONFIRMED` / `FAILED` with
//!   phase preconditions
//! - **Verification**: delivered-energy proofs, deviation against tolerance,
//!   buyer decisions and settlement of verified orders
//! - **Node**: axum endpoints for every action plus read-only views

pub mod client;
pub mod clock;
pub mod config;
pub mod database;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod keys;
pub mod model;
pub mod registry;
pub mod server;
pub mod settlement;
pub mod signing;
pub mod store;
pub mod telemetry;
pub mod transaction;
pub mod verification;
pub mod verification_service;

pub use client::ProtocolClient;
pub use config::AppConfig;
pub use discovery::{RegistryClient, Subscriber, SubscriberType};
pub use engine::{InboundEffect, InboundResult, OutboundRequest, ProtocolEngine, Role};
pub use error::{ProtocolError, Result};
pub use keys::{KeyId, KeyPair};
pub use model::{AckResponse, Action, Context, Envelope};
pub use registry::{KeyRegistry, KeyResolver};
pub use settlement::{Settlement, SettlementState};
pub use signing::{sign, verify, SignatureVerifier, SignedEnvelope, Signer};
pub use store::{KvBackend, MemoryBackend};
pub use transaction::{TransactionState, TransactionStatus, TransactionStore, TransactionUpdate};
pub use verification::{
    calculate_delivered_quantity, calculate_deviation, determine_verification_state, VerificationCase,
    VerificationState,
};
pub use verification_service::VerificationService;
