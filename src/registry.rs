use crate::error::{ProtocolError, Result};
use crate::keys::KeyId;
use crate::signing::{header_key_id, SignatureVerifier, VerifiedSignature};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Fetches keys the registry does not hold yet, typically from a network
/// registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &KeyId) -> Result<Option<VerifyingKey>>;
}

pub struct KeyRegistry {
    keys: RwLock<HashMap<KeyId, VerifyingKey>>,
    verifier: SignatureVerifier,
}

impl KeyRegistry {
    pub fn new(verifier: SignatureVerifier) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            verifier,
        }
    }

    /// Insert or overwrite.
    pub fn register(&self, key_id: KeyId, public_key: VerifyingKey) {
        let previous = self.keys.write().insert(key_id.clone(), public_key);
        if previous.is_some_and(|old| old != public_key) {
            tracing::info!(key_id = %key_id, "Replaced registered public key");
        } else {
            tracing::debug!(key_id = %key_id, "Registered public key");
        }
    }

    pub fn lookup(&self, key_id: &KeyId) -> Option<VerifyingKey> {
        self.keys.read().get(key_id).copied()
    }

    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys.read().contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn verify_from_registry(&self, header: &str, message: &[u8]) -> Result<VerifiedSignature> {
        let key_id = header_key_id(header)?;
        let public_key = self
            .lookup(&key_id)
            .ok_or_else(|| ProtocolError::UnknownKeyId(key_id.to_string()))?;

        self.verifier.verify(header, message, &public_key)
    }

    /// Like `verify_from_registry`, but on a miss asks `resolver` for the key
    /// once and caches what it returns.
    pub async fn verify_or_resolve(
        &self,
        header: &str,
        message: &[u8],
        resolver: &dyn KeyResolver,
    ) -> Result<VerifiedSignature> {
        let key_id = header_key_id(header)?;
        if !self.contains(&key_id) {
            match resolver.resolve(&key_id).await {
                Ok(Some(public_key)) => self.register(key_id.clone(), public_key),
                Ok(None) => return Err(ProtocolError::UnknownKeyId(key_id.to_string())),
                Err(err) => {
                    tracing::warn!(key_id = %key_id, error = %err, "Key lookup failed");
                    return Err(ProtocolError::UnknownKeyId(key_id.to_string()));
                }
            }
        }
        self.verify_from_registry(header, message)
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new(SignatureVerifier::default())
    }
}
