//! Thin adapter over the profile service's credit endpoint (spec §4.J).

use std::time::Duration;

use coachkb_config::ProfileApiConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ChargeError {
    #[error("credit adjustment failed (retryable): {0}")]
    Retryable(String),
    #[error("credit adjustment failed (non-retryable): {0}")]
    NonRetryable(String),
}

impl ChargeError {
    pub fn reason(&self) -> &str {
        match self {
            ChargeError::Retryable(reason) | ChargeError::NonRetryable(reason) => reason,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChargeError::Retryable(_))
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreditErrorBody {
    reason: Option<String>,
}

pub struct CreditLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    backoff: Duration,
}

impl CreditLedger {
    pub fn new(config: &ProfileApiConfig, max_retries: u32, backoff: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_retries,
            backoff,
        })
    }

    /// Debits (negative `delta`) or credits (positive `delta`) a profile's
    /// balance, retrying transient failures. Non-retryable failures
    /// (insufficient_credits, knowledge_base_empty, or any 4xx other than
    /// 429) return immediately so the orchestrator can surface them and, if
    /// this was a debit, roll back its `charged` flag.
    pub async fn adjust_credits(&self, profile_id: &str, delta: i64) -> Result<(), ChargeError> {
        let url = format!("{}/internal/profiles/{}/credits/", self.base_url, profile_id);
        let mut attempt = 0;

        loop {
            let result = self
                .client
                .patch(&url)
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({ "delta": delta }))
                .send()
                .await;

            let classification = match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let reason = response
                        .json::<CreditErrorBody>()
                        .await
                        .ok()
                        .and_then(|body| body.reason)
                        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
                    classify(status, &reason)
                }
                Err(err) => classify_transport(&err),
            };

            if !classification.is_retryable() || attempt >= self.max_retries {
                return Err(classification);
            }

            attempt += 1;
            let delay = self.backoff * attempt;
            warn!(profile_id, delta, attempt, ?delay, "retrying credit adjustment");
            tokio::time::sleep(delay).await;
        }
    }
}

fn classify(status: StatusCode, reason: &str) -> ChargeError {
    if reason == "insufficient_credits" || reason == "knowledge_base_empty" {
        return ChargeError::NonRetryable(reason.to_string());
    }
    // A timeout reported alongside a server error is deliberately treated as
    // non-retryable: retrying an upstream timeout tends to pile more load on
    // an already-slow dependency rather than resolve it.
    if reason == "timeout" {
        return ChargeError::NonRetryable(reason.to_string());
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ChargeError::Retryable(reason.to_string())
    } else {
        ChargeError::NonRetryable(reason.to_string())
    }
}

fn classify_transport(err: &reqwest::Error) -> ChargeError {
    if err.is_timeout() {
        ChargeError::NonRetryable("timeout".to_string())
    } else if err.is_connect() {
        ChargeError::Retryable("connect_error".to_string())
    } else {
        ChargeError::Retryable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_is_never_retryable() {
        let err = classify(StatusCode::PAYMENT_REQUIRED, "insufficient_credits");
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_error_without_known_reason_is_retryable() {
        let err = classify(StatusCode::BAD_GATEWAY, "upstream_unavailable");
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_reason_is_not_retryable_even_on_server_error() {
        let err = classify(StatusCode::GATEWAY_TIMEOUT, "timeout");
        assert!(!err.is_retryable());
    }

    #[test]
    fn too_many_requests_is_retryable() {
        let err = classify(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
        assert!(err.is_retryable());
    }

    #[test]
    fn plain_client_error_is_not_retryable() {
        let err = classify(StatusCode::BAD_REQUEST, "invalid_payload");
        assert!(!err.is_retryable());
    }
}
