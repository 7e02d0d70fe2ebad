use crate::error::{ProtocolError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SIGNING_ALGORITHM: &str = "ed25519";

/// `subscriberId|uniqueKeyId|algorithm`, e.g. `bap.example|prod-key-1|ed25519`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId {
    pub subscriber_id: String,
    pub unique_key_id: String,
    pub algorithm: String,
}

impl KeyId {
    pub fn new(subscriber_id: impl Into<String>, unique_key_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            unique_key_id: unique_key_id.into(),
            algorithm: SIGNING_ALGORITHM.to_string(),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.subscriber_id, self.unique_key_id, self.algorithm)
    }
}

impl FromStr for KeyId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('|').collect();
        match parts.as_slice() {
            [subscriber, unique, algorithm]
                if !subscriber.is_empty() && !unique.is_empty() && !algorithm.is_empty() =>
            {
                Ok(Self {
                    subscriber_id: subscriber.to_string(),
                    unique_key_id: unique.to_string(),
                    algorithm: algorithm.to_string(),
                })
            }
            _ => Err(ProtocolError::MalformedHeader(format!("invalid key id: {}", s))),
        }
    }
}

impl TryFrom<String> for KeyId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyId> for String {
    fn from(key_id: KeyId) -> Self {
        key_id.to_string()
    }
}

pub struct KeyPair {
    key_id: KeyId,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    pub fn generate(key_id: KeyId) -> Self {
        Self::from_seed(key_id, &rand::random::<[u8; 32]>())
    }

    /// Deterministic construction, used when the seed comes from configuration.
    pub fn from_seed(key_id: KeyId, seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            key_id,
            signing_key,
            verifying_key,
        }
    }

    pub fn from_base64_seed(key_id: KeyId, seed: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(seed.trim())
            .map_err(|e| ProtocolError::Config(format!("Invalid signing seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Config("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(key_id, &seed))
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key.to_bytes())
    }

    /// Base64 of the 32-byte seed. Only the keygen tool should print this.
    pub fn seed_base64(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id.to_string())
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::MalformedHeader("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ProtocolError::MalformedHeader(format!("invalid public key: {}", e)))
}
