//! # SDP Negotiation
//!
//! Exchanges the local session description for the remote one over HTTPS.
//!
//! ## Request:
//! `POST <endpoint>?model=<model>` with `Content-Type: application/sdp` and
//! `Authorization: Bearer <ephemeral credential>`; the body is the offer SDP.
//!
//! ## Response:
//! Either the raw answer SDP, or a JSON object with an `sdp` field.

use super::token::EphemeralCredential;
use crate::error::SignalingError;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SignalingClient {
    http: reqwest::Client,
    negotiation_url: String,
    model: String,
}

#[derive(Deserialize)]
struct JsonAnswer {
    sdp: String,
}

impl SignalingClient {
    pub fn new(
        negotiation_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            negotiation_url: negotiation_url.into(),
            model: model.into(),
        })
    }

    /// Send `offer_sdp` and return the remote answer SDP.
    ///
    /// The credential is consumed: a failed negotiation needs a fresh one.
    ///
    /// ## Errors:
    /// - `CredentialExpired` if the credential expired before the request
    /// - `NegotiationRejected` for any non-success status, with the response body
    /// - `Transport` for network failures or an answer that is not SDP
    pub async fn negotiate(
        &self,
        offer_sdp: &str,
        credential: EphemeralCredential,
    ) -> Result<String, SignalingError> {
        if credential.is_expired() {
            return Err(SignalingError::CredentialExpired);
        }

        let url = credential.endpoint().unwrap_or(self.negotiation_url.as_str());
        debug!(url = %url, model = %self.model, offer_len = offer_sdp.len(), "Sending SDP offer");

        let response = self
            .http
            .post(url)
            .query(&[("model", self.model.as_str())])
            .bearer_auth(credential.value())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(SignalingError::NegotiationRejected {
                status: status.as_u16(),
                body,
            });
        }

        let answer = parse_answer(&body)?;
        info!(answer_len = answer.len(), "SDP negotiation complete");
        Ok(answer)
    }
}

fn parse_answer(body: &str) -> Result<String, SignalingError> {
    let trimmed = body.trim_start();
    let sdp = if trimmed.starts_with('{') {
        serde_json::from_str::<JsonAnswer>(trimmed)
            .map_err(|e| SignalingError::Transport(format!("invalid JSON answer: {}", e)))?
            .sdp
    } else {
        body.to_string()
    };

    if !sdp.trim_start().starts_with("v=") {
        return Err(SignalingError::Transport(
            "negotiation answer is not a session description".to_string(),
        ));
    }
    Ok(sdp)
}
