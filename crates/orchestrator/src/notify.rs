//! HMAC-authenticated delivery to the bot service's internal callback
//! endpoints (spec §6.1, §4.I Notify step).

use std::time::Duration;

use coachkb_config::{BotCallbackConfig, InternalAuthConfig};
use coachkb_idempotency::{Flow, IdempotencyState};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

fn path_for(flow: Flow) -> &'static str {
    match flow {
        Flow::Plan => "ai_plan_ready",
        Flow::Diet => "ai_diet_ready",
        Flow::Ask => "ai_answer_ready",
    }
}

fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct BotNotifier {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    api_key: String,
    max_retries: u32,
}

impl BotNotifier {
    pub fn new(bot: &BotCallbackConfig, auth: &InternalAuthConfig, max_retries: u32) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(bot.request_timeout_s)).build()?;
        Ok(Self {
            client,
            base_url: bot.bot_internal_url.trim_end_matches('/').to_string(),
            key_id: auth.key_id.clone(),
            api_key: auth.api_key.clone(),
            max_retries,
        })
    }

    /// Delivers `payload` for `flow`, honoring the delivered/failed dedup
    /// gates and retrying transport/HTTP failures with jittered backoff.
    /// `action` namespaces the dedup key for the Plan flow's create/update.
    pub async fn deliver(
        &self,
        flow: Flow,
        idem: &IdempotencyState,
        request_id: &str,
        action: Option<&str>,
        payload: &JsonValue,
    ) -> anyhow::Result<()> {
        let status = payload.get("status").and_then(|v| v.as_str()).unwrap_or("success");
        let force = payload.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

        if status == "duplicate" {
            debug!(request_id, status, "kb_task.notify_skip");
            return Ok(());
        }
        if status == "success" && idem.is_delivered(flow, request_id, action).await {
            debug!(request_id, status, "kb_task.notify_skip reason=delivered");
            return Ok(());
        }
        if status != "success" && !force && idem.is_failed(flow, request_id, action).await {
            debug!(request_id, status, "kb_task.notify_skip reason=failed");
            return Ok(());
        }

        let body = serde_json::to_vec(payload)?;
        let url = format!("{}/internal/tasks/{}/", self.base_url, path_for(flow));
        info!(request_id, status, "kb_task.notify_start");

        let mut attempt = 0u32;
        loop {
            let timestamp = chrono::Utc::now().timestamp();
            let signature = sign(&self.api_key, timestamp, &body);
            let result = self
                .client
                .post(&url)
                .header("X-Key-Id", &self.key_id)
                .header("X-TS", timestamp.to_string())
                .header("X-Sig", signature)
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => break,
                Ok(response) => {
                    let code = response.status();
                    if attempt >= self.max_retries {
                        anyhow::bail!("notify failed after {attempt} attempts: http {code}");
                    }
                    attempt += 1;
                    warn!(request_id, attempt, %code, "kb_task.notify_retry");
                    tokio::time::sleep(jittered_backoff(attempt)).await;
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err.into());
                    }
                    attempt += 1;
                    warn!(request_id, attempt, error = %err, "kb_task.notify_retry");
                    tokio::time::sleep(jittered_backoff(attempt)).await;
                }
            }
        }

        info!(request_id, status, "kb_task.notify_done");
        if status == "success" {
            idem.mark_delivered(flow, request_id, action).await;
        } else {
            let reason = payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
            idem.mark_failed(flow, request_id, action, reason).await;
        }
        Ok(())
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt as i32 - 1).min(30.0);
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_inputs() {
        let a = sign("secret", 1_700_000_000, b"{}");
        let b = sign("secret", 1_700_000_000, b"{}");
        assert_eq!(a, b);
        assert_ne!(a, sign("other-secret", 1_700_000_000, b"{}"));
    }

    #[test]
    fn path_for_maps_each_flow() {
        assert_eq!(path_for(Flow::Ask), "ai_answer_ready");
        assert_eq!(path_for(Flow::Plan), "ai_plan_ready");
        assert_eq!(path_for(Flow::Diet), "ai_diet_ready");
    }
}
