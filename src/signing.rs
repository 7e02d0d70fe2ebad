//! Detached, time-bounded request signatures.
//!
//! The signature is computed over a signing string built from the creation
//! time, the expiry time and a SHA-512 digest of the body, never over the
//! body itself:
//!
//! ```text
//! (created): 1700000000
//! (expires): 1700000030
//! digest: SHA-512=<base64 digest>
//! ```
//!
//! It travels as a single `Authorization` value
//!
//! ```text
//! Signature keyId="bap.example|key-1|ed25519",algorithm="ed25519",created="1700000000",
//!     expires="1700000030",headers="(created) (expires) digest",signature="<base64>"
//! ```
//!
//! plus a companion `Digest: SHA-512=<base64 digest>` header.

use crate::clock::{SystemTimeSource, TimeSource};
use crate::error::{ProtocolError, Result};
use crate::keys::{KeyId, KeyPair, SIGNING_ALGORITHM};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DIGEST_ALGORITHM: &str = "SHA-512";
pub const SIGNED_HEADERS: &str = "(created) (expires) digest";
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const DIGEST_HEADER: &str = "digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub key_id: KeyId,
    pub algorithm: String,
    pub created: i64,
    pub expires: i64,
    pub digest_algorithm: String,
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    pub fn authorization_header(&self) -> String {
        format!(
            "Signature keyId=\"{}\",algorithm=\"{}\",created=\"{}\",expires=\"{}\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            self.algorithm,
            self.created,
            self.expires,
            SIGNED_HEADERS,
            STANDARD.encode(&self.signature)
        )
    }

    pub fn digest_header(&self) -> String {
        format!("{}={}", self.digest_algorithm, STANDARD.encode(&self.digest))
    }

    /// Short hex fingerprint of the digest, for log lines.
    pub fn digest_fingerprint(&self) -> String {
        hex::encode(&self.digest[..8.min(self.digest.len())])
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub key_id: KeyId,
    pub created: i64,
    pub expires: i64,
}

pub fn compute_digest(message: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(message);
    hasher.finalize().to_vec()
}

fn signing_string(created: i64, expires: i64, digest: &[u8]) -> String {
    format!(
        "(created): {}\n(expires): {}\ndigest: {}={}",
        created,
        expires,
        DIGEST_ALGORITHM,
        STANDARD.encode(digest)
    )
}

/// Signs `message` with a validity window starting at `created`.
pub fn sign_at(message: &[u8], key_pair: &KeyPair, ttl: Duration, created: i64) -> Result<SignedEnvelope> {
    let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    if ttl_seconds <= 0 {
        return Err(ProtocolError::InvalidPayload("signature ttl must be at least one second".to_string()));
    }

    let expires = created
        .checked_add(ttl_seconds)
        .ok_or_else(|| ProtocolError::InvalidPayload(format!("signature ttl of {}s is out of range", ttl_seconds)))?;
    let digest = compute_digest(message);
    let signature = key_pair.sign(signing_string(created, expires, &digest).as_bytes());

    Ok(SignedEnvelope {
        key_id: key_pair.key_id().clone(),
        algorithm: SIGNING_ALGORITHM.to_string(),
        created,
        expires,
        digest_algorithm: DIGEST_ALGORITHM.to_string(),
        digest,
        signature: signature.to_bytes().to_vec(),
    })
}

pub fn sign(message: &[u8], key_pair: &KeyPair, ttl: Duration) -> Result<SignedEnvelope> {
    sign_at(message, key_pair, ttl, SystemTimeSource.unix_seconds())
}

#[derive(Debug)]
struct ParsedHeader {
    key_id: KeyId,
    created: i64,
    expires: i64,
    signature: Signature,
}

fn parse_params(value: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut rest = value.trim();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| ProtocolError::MalformedHeader(format!("expected key=\"value\" near '{}'", rest)))?;
        let name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();

        let quoted = after
            .strip_prefix('"')
            .ok_or_else(|| ProtocolError::MalformedHeader(format!("unquoted value for {}", name)))?;
        let close = quoted
            .find('"')
            .ok_or_else(|| ProtocolError::MalformedHeader(format!("unterminated value for {}", name)))?;

        if name.is_empty() {
            return Err(ProtocolError::MalformedHeader("empty parameter name".to_string()));
        }
        params.insert(name, quoted[..close].to_string());

        rest = quoted[close + 1..].trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
        } else if !rest.is_empty() {
            return Err(ProtocolError::MalformedHeader(format!("unexpected trailing input '{}'", rest)));
        }
    }

    Ok(params)
}

fn parse_header(header: &str) -> Result<ParsedHeader> {
    let trimmed = header.trim();
    let body = trimmed
        .strip_prefix("Signature ")
        .ok_or_else(|| ProtocolError::MalformedHeader("expected the Signature scheme".to_string()))?;
    let params = parse_params(body)?;

    let required = |name: &str| {
        params
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::MalformedHeader(format!("missing {}", name)))
    };

    let key_id: KeyId = required("keyId")?.parse()?;
    let signature_b64 = required("signature")?;
    let headers = required("headers")?;
    if headers != SIGNED_HEADERS {
        return Err(ProtocolError::MalformedHeader(format!("unsupported signed components: {}", headers)));
    }

    if let Some(algorithm) = params.get("algorithm") {
        if algorithm != SIGNING_ALGORITHM {
            return Err(ProtocolError::MalformedHeader(format!("unsupported algorithm: {}", algorithm)));
        }
    }

    let created: i64 = required("created")?
        .parse()
        .map_err(|_| ProtocolError::MalformedHeader("created is not a unix timestamp".to_string()))?;
    let expires: i64 = required("expires")?
        .parse()
        .map_err(|_| ProtocolError::MalformedHeader("expires is not a unix timestamp".to_string()))?;
    if expires <= created {
        return Err(ProtocolError::MalformedHeader("expires must be after created".to_string()));
    }

    let signature_bytes = STANDARD.decode(signature_b64)?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| ProtocolError::MalformedHeader(format!("invalid signature bytes: {}", e)))?;

    Ok(ParsedHeader {
        key_id,
        created,
        expires,
        signature,
    })
}

/// Extracts the key id without checking anything else, so the caller can
/// resolve the sender's public key.
pub fn header_key_id(header: &str) -> Result<KeyId> {
    parse_header(header).map(|parsed| parsed.key_id)
}

/// Verifies `header` against `message` as of unix time `now`.
pub fn verify_at(
    header: &str,
    message: &[u8],
    public_key: &VerifyingKey,
    now: i64,
    clock_skew_seconds: i64,
) -> Result<VerifiedSignature> {
    let parsed = parse_header(header)?;

    if now > parsed.expires {
        return Err(ProtocolError::Expired(format!(
            "signature from {} expired at {} (now {})",
            parsed.key_id, parsed.expires, now
        )));
    }
    if parsed.created > now + clock_skew_seconds {
        return Err(ProtocolError::Expired(format!(
            "signature from {} not valid until {} (now {})",
            parsed.key_id, parsed.created, now
        )));
    }

    let digest = compute_digest(message);
    let signed = signing_string(parsed.created, parsed.expires, &digest);

    public_key
        .verify(signed.as_bytes(), &parsed.signature)
        .map_err(|_| {
            ProtocolError::TamperDetected(format!(
                "signature from {} does not match the message digest or the supplied key",
                parsed.key_id
            ))
        })?;

    Ok(VerifiedSignature {
        key_id: parsed.key_id,
        created: parsed.created,
        expires: parsed.expires,
    })
}

pub fn verify(header: &str, message: &[u8], public_key: &VerifyingKey) -> Result<VerifiedSignature> {
    verify_at(header, message, public_key, SystemTimeSource.unix_seconds(), 0)
}

/// Checks a companion `Digest` header against the body.
pub fn verify_digest_header(digest_header: &str, message: &[u8]) -> Result<()> {
    let (algorithm, encoded) = digest_header
        .trim()
        .split_once('=')
        .ok_or_else(|| ProtocolError::MalformedHeader("digest header must be <algorithm>=<value>".to_string()))?;

    if algorithm != DIGEST_ALGORITHM {
        return Err(ProtocolError::MalformedHeader(format!("unsupported digest algorithm: {}", algorithm)));
    }

    let claimed = STANDARD.decode(encoded)?;
    if claimed != compute_digest(message) {
        return Err(ProtocolError::TamperDetected("digest header does not match body".to_string()));
    }
    Ok(())
}

/// Signs outbound bodies with the node's own key.
#[derive(Clone)]
pub struct Signer {
    key_pair: Arc<KeyPair>,
    ttl: Duration,
    clock: Arc<dyn TimeSource>,
}

impl Signer {
    pub fn new(key_pair: Arc<KeyPair>, ttl: Duration, clock: Arc<dyn TimeSource>) -> Self {
        Self { key_pair, ttl, clock }
    }

    pub fn key_id(&self) -> &KeyId {
        self.key_pair.key_id()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn sign(&self, message: &[u8]) -> Result<SignedEnvelope> {
        sign_at(message, &self.key_pair, self.ttl, self.clock.unix_seconds())
    }
}

/// Verifies inbound headers against a known public key.
#[derive(Clone)]
pub struct SignatureVerifier {
    clock: Arc<dyn TimeSource>,
    clock_skew_seconds: i64,
}

impl SignatureVerifier {
    pub fn new(clock: Arc<dyn TimeSource>, clock_skew_seconds: i64) -> Self {
        Self {
            clock,
            clock_skew_seconds,
        }
    }

    pub fn verify(&self, header: &str, message: &[u8], public_key: &VerifyingKey) -> Result<VerifiedSignature> {
        verify_at(header, message, public_key, self.clock.unix_seconds(), self.clock_skew_seconds)
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource), 0)
    }
}
