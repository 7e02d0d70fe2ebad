use crate::{
    error::{ProtocolError, Result},
    keys::{decode_public_key, KeyId, KeyPair},
    registry::KeyResolver,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriberType {
    Bap,
    Bpp,
    Bg,
}

impl SubscriberType {
    pub fn from_role(role: &str) -> Result<Self> {
        match role {
            "bap" => Ok(SubscriberType::Bap),
            "bpp" => Ok(SubscriberType::Bpp),
            "bg" => Ok(SubscriberType::Bg),
            other => Err(ProtocolError::Config(format!("Unknown role: {}", other))),
        }
    }
}

/// A network participant as published by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub subscriber_id: String,
    pub subscriber_url: String,
    #[serde(rename = "type")]
    pub subscriber_type: SubscriberType,
    pub domain: String,
    #[serde(rename = "ukId")]
    pub unique_key_id: String,
    pub signing_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn key_id(&self) -> KeyId {
        KeyId::new(self.subscriber_id.clone(), self.unique_key_id.clone())
    }

    pub fn public_key(&self) -> Result<VerifyingKey> {
        decode_public_key(&self.signing_public_key)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let subscribed = self
            .status
            .as_deref()
            .map_or(true, |status| status.eq_ignore_ascii_case("SUBSCRIBED"));
        subscribed
            && self.valid_from.map_or(true, |from| from <= now)
            && self.valid_until.map_or(true, |until| now < until)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub subscriber_type: Option<SubscriberType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "ukId", skip_serializing_if = "Option::is_none")]
    pub unique_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    #[serde(default)]
    pub status: Option<String>,
}

/// HTTP client for the network registry: publishes our own key and looks up
/// counterparties' keys.
pub struct RegistryClient {
    endpoint: String,
    client: Client,
}

impl RegistryClient {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn subscribe(
        &self,
        key_pair: &KeyPair,
        subscriber_url: &str,
        subscriber_type: SubscriberType,
        domain: &str,
    ) -> Result<SubscribeResponse> {
        let key_id = key_pair.key_id();
        let request = Subscriber {
            subscriber_id: key_id.subscriber_id.clone(),
            subscriber_url: subscriber_url.to_string(),
            subscriber_type,
            domain: domain.to_string(),
            unique_key_id: key_id.unique_key_id.clone(),
            signing_public_key: key_pair.public_key_base64(),
            status: None,
            valid_from: Some(Utc::now()),
            valid_until: None,
        };

        let response = self
            .client
            .post(format!("{}/subscribe", self.endpoint))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(key_id = %key_id, registry = %self.endpoint, "Subscribed to registry");
        Ok(response.json().await?)
    }

    pub async fn lookup(&self, request: &LookupRequest) -> Result<Vec<Subscriber>> {
        let subscribers: Vec<Subscriber> = self
            .client
            .post(format!("{}/lookup", self.endpoint))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(count = subscribers.len(), "Registry lookup");
        Ok(subscribers)
    }

    /// Looks up the live key for `key_id`.
    pub async fn resolve_key(&self, key_id: &KeyId) -> Result<Option<VerifyingKey>> {
        let request = LookupRequest {
            subscriber_id: Some(key_id.subscriber_id.clone()),
            unique_key_id: Some(key_id.unique_key_id.clone()),
            ..LookupRequest::default()
        };

        let now = Utc::now();
        let subscriber = self
            .lookup(&request)
            .await?
            .into_iter()
            .find(|s| s.key_id() == *key_id && s.is_valid_at(now));

        subscriber.map(|s| s.public_key()).transpose()
    }
}

#[async_trait]
impl KeyResolver for RegistryClient {
    async fn resolve(&self, key_id: &KeyId) -> Result<Option<VerifyingKey>> {
        self.resolve_key(key_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscriber_json(kp: &KeyPair, status: &str) -> serde_json::Value {
        json!({
            "subscriber_id": kp.key_id().subscriber_id,
            "subscriber_url": "http://bpp.example/beckn",
            "type": "BPP",
            "domain": "energy:p2p-trading",
            "ukId": kp.key_id().unique_key_id,
            "signing_public_key": kp.public_key_base64(),
            "status": status
        })
    }

    #[tokio::test]
    async fn test_resolve_key_from_lookup() {
        let server = MockServer::start().await;
        let kp = KeyPair::generate(KeyId::new("bpp.example", "key-1"));

        Mock::given(method("POST"))
            .and(path("/lookup"))
            .and(body_partial_json(json!({"subscriber_id": "bpp.example", "ukId": "key-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscriber_json(&kp, "SUBSCRIBED")])))
            .mount(&server)
            .await;

        let client = RegistryClient::new(server.uri(), Some(Duration::from_secs(2))).unwrap();
        let key = client.resolve_key(kp.key_id()).await.unwrap();
        assert_eq!(key, Some(kp.verifying_key()));
    }

    #[tokio::test]
    async fn test_unsubscribed_key_is_ignored() {
        let server = MockServer::start().await;
        let kp = KeyPair::generate(KeyId::new("bpp.example", "key-1"));

        Mock::given(method("POST"))
            .and(path("/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscriber_json(&kp, "EXPIRED")])))
            .mount(&server)
            .await;

        let client = RegistryClient::new(server.uri(), None).unwrap();
        assert_eq!(client.resolve_key(kp.key_id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_posts_public_key() {
        let server = MockServer::start().await;
        let kp = KeyPair::generate(KeyId::new("bap.example", "key-2"));

        Mock::given(method("POST"))
            .and(path("/subscribe"))
            .and(body_partial_json(json!({
                "subscriber_id": "bap.example",
                "type": "BAP",
                "signing_public_key": kp.public_key_base64()
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "UNDER_SUBSCRIPTION"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = RegistryClient::new(format!("{}/", server.uri()), None).unwrap();
        let response = client
            .subscribe(&kp, "http://bap.example/beckn", SubscriberType::Bap, "energy:p2p-trading")
            .await
            .unwrap();
        assert_eq!(response.status.as_deref(), Some("UNDER_SUBSCRIPTION"));
    }

    #[tokio::test]
    async fn test_registry_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lookup"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = RegistryClient::new(server.uri(), None).unwrap();
        let err = client.lookup(&LookupRequest::default()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_subscriber_validity_window() {
        let kp = KeyPair::generate(KeyId::new("bpp.example", "key-1"));
        let mut subscriber: Subscriber = serde_json::from_value(subscriber_json(&kp, "SUBSCRIBED")).unwrap();
        let now = Utc::now();
        assert!(subscriber.is_valid_at(now));

        subscriber.valid_until = Some(now - chrono::Duration::seconds(1));
        assert!(!subscriber.is_valid_at(now));
    }
}
