use crate::{
    engine::{OutboundRequest, ProtocolEngine},
    error::{ProtocolError, Result},
    model::{AckResponse, Action, Context},
    signing::{AUTHORIZATION_HEADER, DIGEST_HEADER},
};
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Sends signed protocol messages to counterparties.
///
/// State is recorded before the message leaves; a transport failure is
/// returned to the caller, who decides whether to resend.
pub struct ProtocolClient {
    engine: Arc<ProtocolEngine>,
    client: Client,
}

impl ProtocolClient {
    pub fn new(engine: Arc<ProtocolEngine>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            engine,
            client: builder.build()?,
        })
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// POSTs a prepared message to `{target_uri}/{action}`.
    pub async fn send(&self, target_uri: &str, request: &OutboundRequest) -> Result<AckResponse> {
        let url = format!("{}/{}", target_uri.trim_end_matches('/'), request.action());

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION_HEADER, &request.authorization)
            .header(DIGEST_HEADER, &request.digest)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone())
            .send()
            .await?;

        // NACKs come back as 4xx with an ack body; only 5xx is a transport error.
        if response.status().is_server_error() {
            response.error_for_status_ref()?;
        }

        let status = response.status();
        let ack: AckResponse = response.json().await.map_err(|e| {
            ProtocolError::InvalidPayload(format!("{} returned {} without an ack: {}", url, status, e))
        })?;

        if !ack.is_ack() {
            tracing::warn!(url = %url, error = ?ack.error, "Counterparty rejected message");
        }
        Ok(ack)
    }

    /// Prepares a request and sends it to `target_uri`.
    pub async fn request<M: Serialize>(
        &self,
        action: Action,
        transaction_id: &str,
        counterparty: Option<(&str, &str)>,
        target_uri: &str,
        message: &M,
    ) -> Result<(OutboundRequest, AckResponse)> {
        let request = self
            .engine
            .prepare_request(action, transaction_id, counterparty, message)
            .await?;
        let ack = self.send(target_uri, &request).await?;
        Ok((request, ack))
    }

    /// Prepares the callback for `request` and sends it to the requester.
    pub async fn callback<M: Serialize>(
        &self,
        request: &Context,
        action: Action,
        message: &M,
    ) -> Result<AckResponse> {
        let callback = self.engine.prepare_callback(request, action, message).await?;
        self.send(&request.bap_uri, &callback).await
    }
}
