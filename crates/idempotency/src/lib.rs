//! Per-request idempotency flags for the task orchestrator (spec §4.L, §6.5).
//!
//! A thin typed wrapper over Redis `SET NX` / `EXISTS` / `DEL` / `SET EX`.
//! Every operation is best-effort: a Redis failure degrades to "assume
//! claimed" rather than "assume free", trading a possibly-dropped retry
//! for the guarantee that we never double-execute or double-charge.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

/// The three task flows that share the claim/charge/notify/refund contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Plan,
    Diet,
    Ask,
}

impl Flow {
    fn as_str(self) -> &'static str {
        match self {
            Flow::Plan => "plan",
            Flow::Diet => "diet",
            Flow::Ask => "ask",
        }
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// `ai:<flow>:<field>:<rid>`, optionally namespaced by `action` for the plan
/// flow's `create`/`update` notify dedup keys (spec §4.I "Plan-specific
/// details").
fn key(flow: Flow, field: &str, request_id: &str, action: Option<&str>) -> String {
    match action {
        Some(action) => format!("ai:{}:{}:{}:{}", flow.as_str(), field, request_id, action),
        None => format!("ai:{}:{}:{}", flow.as_str(), field, request_id),
    }
}

#[derive(Clone)]
pub struct IdempotencyState {
    conn: ConnectionManager,
    ttl: Duration,
}

impl IdempotencyState {
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    /// `SET key 1 NX EX ttl`. Returns `true` when this call is the one that
    /// created the key (i.e. it should proceed), `false` when a prior call
    /// already holds it (duplicate). Redis errors are treated as "already
    /// claimed" per the best-effort policy in spec §4.L.
    async fn set_nx(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .with_expiration(redis::SetExpiry::EX(self.ttl.as_secs().max(1)))
            .conditional_set(redis::ExistenceCheck::NX);
        match conn.set_options::<_, _, bool>(key, "1", opts).await {
            Ok(created) => created,
            Err(err) => {
                warn!(key, error = %err, "idempotency set_nx failed, assuming already claimed");
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.exists::<_, bool>(key).await {
            Ok(present) => present,
            Err(err) => {
                warn!(key, error = %err, "idempotency exists check failed, assuming claimed");
                true
            }
        }
    }

    async fn del(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.del::<_, ()>(key).await {
            warn!(key, error = %err, "idempotency del failed");
        }
    }

    /// Delivery claim: true only on the first call for a given request.
    pub async fn claim(&self, flow: Flow, request_id: &str) -> bool {
        self.set_nx(&key(flow, "claim", request_id, None)).await
    }

    /// Task dedup used in the Execute step's `claim_task(rid)` (spec §4.I
    /// step 1): true when this invocation should actually run the task.
    pub async fn claim_task(&self, flow: Flow, request_id: &str) -> bool {
        self.set_nx(&key(flow, "task", request_id, None)).await
    }

    pub async fn is_delivered(&self, flow: Flow, request_id: &str, action: Option<&str>) -> bool {
        self.exists(&key(flow, "delivered", request_id, action)).await
    }

    pub async fn mark_delivered(&self, flow: Flow, request_id: &str, action: Option<&str>) {
        self.set_nx(&key(flow, "delivered", request_id, action)).await;
    }

    pub async fn is_failed(&self, flow: Flow, request_id: &str, action: Option<&str>) -> bool {
        self.exists(&key(flow, "failed", request_id, action)).await
    }

    /// Records the failure reason so a caller may inspect why a notify was
    /// suppressed. The reason is stored as the key's value, not just a
    /// sentinel, matching the original's `failed(rid, reason)`.
    pub async fn mark_failed(&self, flow: Flow, request_id: &str, action: Option<&str>, reason: &str) {
        let mut conn = self.conn.clone();
        let k = key(flow, "failed", request_id, action);
        let opts = redis::SetOptions::default()
            .with_expiration(redis::SetExpiry::EX(self.ttl.as_secs().max(1)))
            .conditional_set(redis::ExistenceCheck::NX);
        if let Err(err) = conn.set_options::<_, _, bool>(&k, reason, opts).await {
            warn!(key = %k, error = %err, "idempotency mark_failed failed");
        }
    }

    /// `charged` NX. Returns `true` if this call is the one that should
    /// actually debit credits.
    pub async fn mark_charged(&self, flow: Flow, request_id: &str) -> bool {
        self.set_nx(&key(flow, "charged", request_id, None)).await
    }

    pub async fn is_charged(&self, flow: Flow, request_id: &str) -> bool {
        self.exists(&key(flow, "charged", request_id, None)).await
    }

    /// Rolls back a charge flag after the profile API call itself failed
    /// (spec §4.I step 2: "on failure un-set `charged` and bubble error").
    pub async fn unmark_charged(&self, flow: Flow, request_id: &str) {
        self.del(&key(flow, "charged", request_id, None)).await;
    }

    pub async fn is_refunded(&self, flow: Flow, request_id: &str) -> bool {
        self.exists(&key(flow, "refunded", request_id, None)).await
    }

    pub async fn mark_refunded(&self, flow: Flow, request_id: &str) {
        self.set_nx(&key(flow, "refunded", request_id, None)).await;
    }

    /// `SET refund_lock token NX PX ttl`; returns the token when acquired so
    /// the caller can release with the matching compare-and-del, mirroring
    /// [`coachkb_locks::RedisLock`] but scoped to the refund step (spec §4.I
    /// "Refund step" 1/5).
    pub async fn try_acquire_refund_lock(&self, flow: Flow, request_id: &str, ttl: Duration) -> Option<String> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let k = key(flow, "refund_lock", request_id, None);
        let opts = redis::SetOptions::default()
            .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as u64))
            .conditional_set(redis::ExistenceCheck::NX);
        match conn.set_options::<_, _, bool>(&k, token.clone(), opts).await {
            Ok(true) => Some(token),
            Ok(false) => None,
            Err(err) => {
                warn!(key = %k, error = %err, "refund_lock acquire failed, assuming held elsewhere");
                None
            }
        }
    }

    pub async fn release_refund_lock(&self, flow: Flow, request_id: &str, token: &str) {
        let mut conn = self.conn.clone();
        let k = key(flow, "refund_lock", request_id, None);
        let script = redis::Script::new(RELEASE_SCRIPT);
        if let Err(err) = script.key(&k).arg(token).invoke_async::<i64>(&mut conn).await {
            warn!(key = %k, error = %err, "refund_lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespaces_by_flow_field_and_request() {
        assert_eq!(key(Flow::Ask, "claim", "rid-1", None), "ai:ask:claim:rid-1");
        assert_eq!(
            key(Flow::Plan, "delivered", "rid-2", Some("create")),
            "ai:plan:delivered:rid-2:create"
        );
    }
}
