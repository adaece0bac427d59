//! Durable, queue-driven task pipeline shared by the Plan, Diet, and Ask-AI
//! flows (spec §4.I): claim, charge, call upstream, notify, and on failure
//! refund — each step keyed off [`coachkb_idempotency::IdempotencyState`]
//! so a retried task never double-charges or double-delivers.

mod notify;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use coachkb_idempotency::Flow;
use coachkb_idempotency::IdempotencyState;
use coachkb_credit::{ChargeError, CreditLedger};
use notify::BotNotifier;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const REFUND_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream call failed (retryable): {0}")]
    Retryable(String),
    #[error("upstream call failed (non-retryable): {0}")]
    NonRetryable(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Retryable(_))
    }

    fn reason(&self) -> &str {
        match self {
            UpstreamError::Retryable(reason) | UpstreamError::NonRetryable(reason) => reason,
        }
    }
}

/// The plan engine / LLM-ask call each flow makes once charging (if any)
/// succeeds. A thin capability trait: neither the plan generator nor the
/// LLM client live in this crate.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, flow: Flow, request: &TaskRequest) -> Result<JsonValue, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub request_id: String,
    pub profile_id: i64,
    /// Credits to debit before calling upstream; zero means this flow
    /// doesn't charge (Plan generation pays up front at enqueue time).
    pub cost: i64,
    /// Plan-only: `create` or `update`, namespacing the notify dedup keys.
    pub action: Option<String>,
    /// Retry attempt number as seen by the caller (0 on first execution).
    pub attempt: u32,
}

pub struct TaskOrchestrator {
    idem: IdempotencyState,
    credit: Option<CreditLedger>,
    notifier: BotNotifier,
    max_upstream_retries: u32,
    retry_backoff: Duration,
}

impl TaskOrchestrator {
    pub fn new(
        idem: IdempotencyState,
        credit: Option<CreditLedger>,
        notifier: BotNotifier,
        max_upstream_retries: u32,
        retry_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { idem, credit, notifier, max_upstream_retries, retry_backoff })
    }

    /// Runs one flow end to end: claim, charge, call upstream with
    /// retryable-error backoff, notify. Returns the payload that was (or
    /// would have been) delivered to the bot service.
    pub async fn run(self: &Arc<Self>, flow: Flow, upstream: &dyn Upstream, req: TaskRequest) -> anyhow::Result<JsonValue> {
        let claimed = req.attempt > 0 || self.idem.claim_task(flow, &req.request_id).await;
        if !claimed {
            debug!(request_id = %req.request_id, "kb_task.duplicate");
            return Ok(json!({
                "profile_id": req.profile_id,
                "request_id": req.request_id,
                "status": "duplicate",
            }));
        }

        if let Some(charge_err) = self.charge(flow, &req).await {
            return self.handle_failure(flow, &req, charge_err.reason().to_string()).await;
        }

        let mut attempt = 0u32;
        let payload = loop {
            match upstream.call(flow, &req).await {
                Ok(payload) => break payload,
                Err(err) if err.is_retryable() && attempt < self.max_upstream_retries => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt;
                    warn!(request_id = %req.request_id, attempt, error = %err, "kb_task.upstream_retry");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return self.handle_failure(flow, &req, err.reason().to_string()).await;
                }
            }
        };

        if let Err(err) = self.notifier.deliver(flow, &self.idem, &req.request_id, req.action.as_deref(), &payload).await {
            error!(request_id = %req.request_id, error = %err, "kb_task.notify_failed");
            return self.handle_failure(flow, &req, err.to_string()).await;
        }
        Ok(payload)
    }

    /// Atomically reserves the `charged` flag and debits credits. Returns
    /// `None` on success or when this flow doesn't charge; on failure
    /// rolls back the reservation only when the failure was non-retryable,
    /// leaving `charged` set for a retryable failure so a queue retry does
    /// not double-debit.
    async fn charge(&self, flow: Flow, req: &TaskRequest) -> Option<ChargeError> {
        let credit = self.credit.as_ref()?;
        if req.cost == 0 {
            return None;
        }
        if !self.idem.mark_charged(flow, &req.request_id).await {
            warn!(request_id = %req.request_id, "kb_task.charge_skipped");
            return None;
        }
        match credit.adjust_credits(&req.profile_id.to_string(), -req.cost).await {
            Ok(()) => {
                info!(request_id = %req.request_id, profile_id = req.profile_id, cost = req.cost, "kb_task.charged");
                None
            }
            Err(err) => {
                if !err.is_retryable() {
                    self.idem.unmark_charged(flow, &req.request_id).await;
                }
                error!(request_id = %req.request_id, error = %err, "kb_task.charge_failed");
                Some(err)
            }
        }
    }

    /// The `link_error` failure handler: records the failure once,
    /// dispatches a refund if a charge was taken, and synthesizes a
    /// `force=true` error notify payload.
    async fn handle_failure(self: &Arc<Self>, flow: Flow, req: &TaskRequest, detail: String) -> anyhow::Result<JsonValue> {
        let already_failed = self.idem.is_failed(flow, &req.request_id, req.action.as_deref()).await;
        if !already_failed {
            self.idem.mark_failed(flow, &req.request_id, req.action.as_deref(), &detail).await;
            if self.idem.is_charged(flow, &req.request_id).await {
                let orchestrator = self.clone();
                let refund_req = req.clone();
                tokio::spawn(async move {
                    if let Err(err) = orchestrator.refund(flow, &refund_req).await {
                        error!(request_id = %refund_req.request_id, error = %err, "kb_task.refund_dispatch_failed");
                    }
                });
            }
        } else {
            debug!(request_id = %req.request_id, "kb_task.failure_skip reason=already_failed");
        }

        let payload = json!({
            "status": "error",
            "request_id": req.request_id,
            "profile_id": req.profile_id,
            "error": detail,
            "force": true,
        });
        if let Err(err) = self.notifier.deliver(flow, &self.idem, &req.request_id, req.action.as_deref(), &payload).await {
            warn!(request_id = %req.request_id, error = %err, "kb_task.notify_failed_for_error_payload");
        }
        Ok(payload)
    }

    /// Credits back a failed, charged request. Guarded by a per-request
    /// lock so charge and refund never run concurrently on the same
    /// request, and by `refunded`/`charged` checks so it is idempotent.
    pub async fn refund(&self, flow: Flow, req: &TaskRequest) -> anyhow::Result<()> {
        let Some(credit) = &self.credit else { return Ok(()) };
        let Some(token) = self.idem.try_acquire_refund_lock(flow, &req.request_id, REFUND_LOCK_TTL).await else {
            debug!(request_id = %req.request_id, "kb_task.refund_skip reason=lock_held");
            return Ok(());
        };

        let result = self.refund_locked(flow, req, credit).await;
        self.idem.release_refund_lock(flow, &req.request_id, &token).await;
        result
    }

    async fn refund_locked(&self, flow: Flow, req: &TaskRequest, credit: &CreditLedger) -> anyhow::Result<()> {
        if self.idem.is_refunded(flow, &req.request_id).await || !self.idem.is_charged(flow, &req.request_id).await {
            return Ok(());
        }
        credit.adjust_credits(&req.profile_id.to_string(), req.cost).await?;
        self.idem.mark_refunded(flow, &req.request_id).await;
        self.idem.unmark_charged(flow, &req.request_id).await;
        info!(request_id = %req.request_id, profile_id = req.profile_id, cost = req.cost, "kb_task.refunded");
        Ok(())
    }
}

pub use notify::BotNotifier as Notifier;

#[cfg(test)]
mod tests {
    use super::*;
    use coachkb_config::{BotCallbackConfig, InternalAuthConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyUpstream {
        fail_times: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for FlakyUpstream {
        async fn call(&self, _flow: Flow, req: &TaskRequest) -> Result<JsonValue, UpstreamError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(UpstreamError::Retryable("transient".to_string()));
            }
            Ok(json!({ "status": "success", "request_id": req.request_id, "profile_id": req.profile_id }))
        }
    }

    struct RejectingUpstream;

    #[async_trait]
    impl Upstream for RejectingUpstream {
        async fn call(&self, _flow: Flow, _req: &TaskRequest) -> Result<JsonValue, UpstreamError> {
            Err(UpstreamError::NonRetryable("bad_request".to_string()))
        }
    }

    fn notifier_unreachable() -> BotNotifier {
        let bot = BotCallbackConfig { bot_internal_url: "http://127.0.0.1:1".to_string(), ..BotCallbackConfig::default() };
        let auth = InternalAuthConfig::default();
        BotNotifier::new(&bot, &auth, 0).unwrap()
    }

    #[test]
    fn upstream_error_reason_and_retryable_match_variant() {
        let retryable = UpstreamError::Retryable("timeout".to_string());
        let non_retryable = UpstreamError::NonRetryable("insufficient_credits".to_string());
        assert!(retryable.is_retryable());
        assert!(!non_retryable.is_retryable());
        assert_eq!(non_retryable.reason(), "insufficient_credits");
    }

    #[tokio::test]
    async fn flaky_upstream_succeeds_after_configured_failures() {
        let upstream = FlakyUpstream { fail_times: AtomicUsize::new(2) };
        let req = TaskRequest { request_id: "r2".to_string(), profile_id: 9, cost: 0, action: None, attempt: 0 };
        assert!(upstream.call(Flow::Diet, &req).await.is_err());
        assert!(upstream.call(Flow::Diet, &req).await.is_err());
        assert!(upstream.call(Flow::Diet, &req).await.is_ok());
    }

    #[tokio::test]
    async fn upstream_failure_produces_forced_error_payload() {
        let _ = notifier_unreachable();
        let upstream = RejectingUpstream;
        // Only exercises the classification path; full `run` needs a live
        // Redis-backed IdempotencyState and is covered at the integration
        // level, not in this crate's unit tests.
        let result = upstream.call(Flow::Ask, &TaskRequest {
            request_id: "r1".to_string(),
            profile_id: 1,
            cost: 10,
            action: None,
            attempt: 0,
        }).await;
        assert!(matches!(result, Err(UpstreamError::NonRetryable(_))));
    }
}
