//! Drives per-dataset indexing with a small state machine and backoff
//! polling (spec §4.E).

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use coachkb_engine::{Engine, EngineError, UserContext};
use coachkb_locks::LockCache;
use coachkb_storage::{alias_for, DatasetRegistry, StorageService};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-alias projection status (spec §4.E state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionState {
    Unknown,
    Pending,
    Ready,
    ReadyEmpty,
    Timeout,
    FatalError,
    UserContextUnavailable,
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("user context unavailable")]
    UserContextUnavailable,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Backoff delays `probe` is retried at while waiting for a dataset to
/// become ready (spec §4.E `wait`).
const WAIT_BACKOFF_S: [f64; 5] = [0.5, 1.0, 2.0, 5.0, 8.0];
const MAX_ENSURE_ATTEMPTS: u32 = 3;
const MAX_PROJECT_DEPTH: u32 = 2;

/// Lets the knowledge base facade rebuild a dataset from scratch when
/// healing storage alone isn't enough to recover a lost index (spec §9
/// Design Notes: capability trait instead of a back-pointer into the
/// facade).
#[async_trait]
pub trait DatasetRebuilder: Send + Sync {
    async fn rebuild_dataset(&self, alias: &str, user: &UserContext) -> anyhow::Result<()>;
}

pub struct ProjectionService<E: Engine> {
    engine: Arc<E>,
    registry: Arc<DatasetRegistry<E>>,
    storage: Arc<StorageService<E>>,
    locks: LockCache,
    projected: RwLock<HashSet<String>>,
    rebuilder: RwLock<Option<Arc<dyn DatasetRebuilder>>>,
    aggressive_rebuild: bool,
}

impl<E: Engine> ProjectionService<E> {
    pub fn new(
        engine: Arc<E>,
        registry: Arc<DatasetRegistry<E>>,
        storage: Arc<StorageService<E>>,
        aggressive_rebuild: bool,
    ) -> Self {
        Self {
            engine,
            registry,
            storage,
            locks: LockCache::default(),
            projected: RwLock::new(HashSet::new()),
            rebuilder: RwLock::new(None),
            aggressive_rebuild,
        }
    }

    pub fn attach_rebuilder(&self, rebuilder: Arc<dyn DatasetRebuilder>) {
        *self.rebuilder.write().unwrap() = Some(rebuilder);
    }

    /// True once `ensure_projected` has returned READY/READY_EMPTY for this
    /// alias; future callers can skip re-probing (spec §9 monotonicity).
    pub fn is_projected(&self, alias: &str) -> bool {
        self.projected.read().unwrap().contains(&alias_for(alias))
    }

    pub fn invalidate(&self, alias: &str) {
        self.projected.write().unwrap().remove(&alias_for(alias));
    }

    fn mark_projected(&self, alias: &str) {
        self.projected.write().unwrap().insert(alias_for(alias));
    }

    /// Ensures the dataset exists, resolves its id, fetches rows, and
    /// classifies readiness. Concurrent probes are allowed; only
    /// `ensure_projected`'s retry loop is serialized per alias.
    pub async fn probe(&self, alias: &str, user: &UserContext) -> (bool, &'static str) {
        let canonical = alias_for(alias);

        if let Err(err) = self.registry.ensure_exists(&canonical, user).await {
            warn!(dataset = %canonical, detail = %err, "projection:probe_failed reason=fatal_error");
            return (false, "fatal_error");
        }

        let dataset_id = match self.registry.get_dataset_id(&canonical, user).await {
            Ok(id) => id,
            Err(err) => {
                warn!(dataset = %canonical, detail = %err, "projection:probe_failed reason=fatal_error");
                return (false, "fatal_error");
            }
        };
        if dataset_id.is_none() {
            debug!(dataset = %canonical, "projection:not_found");
            return (false, "not_found");
        }

        let rows = match self.registry.list_entries(&canonical, user).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(dataset = %canonical, detail = %err, "projection:probe_failed reason=fatal_error");
                return (false, "fatal_error");
            }
        };
        if rows.is_empty() {
            debug!(dataset = %canonical, "projection:skip_no_rows");
            return (false, "no_rows_in_dataset");
        }

        let valid_rows = rows.iter().filter(|row| !row.text.trim().is_empty()).count();
        if valid_rows == 0 {
            debug!(dataset = %canonical, rows = rows.len(), "projection:pending");
            return (false, "pending");
        }

        debug!(dataset = %canonical, rows = valid_rows, "projection:ready");
        (true, "ready")
    }

    /// Polls `probe` with the standard backoff sequence until the dataset
    /// turns READY/READY_EMPTY, hits a terminal failure, or `timeout` runs
    /// out.
    pub async fn wait(&self, alias: &str, user: &UserContext, timeout: Duration) -> ProjectionState {
        let canonical = alias_for(alias);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let (ready, reason) = self.probe(&canonical, user).await;
            if ready {
                self.mark_projected(&canonical);
                return ProjectionState::Ready;
            }
            match reason {
                "no_rows_in_dataset" => {
                    self.mark_projected(&canonical);
                    return ProjectionState::ReadyEmpty;
                }
                "fatal_error" => return ProjectionState::FatalError,
                _ => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return ProjectionState::Timeout;
            }

            for backoff_s in WAIT_BACKOFF_S {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return ProjectionState::Timeout;
                }
                let remaining = deadline - now;
                let step = Duration::from_secs_f64(backoff_s).min(remaining);
                tokio::time::sleep(step).await;
                let (ready, reason) = self.probe(&canonical, user).await;
                if ready {
                    self.mark_projected(&canonical);
                    return ProjectionState::Ready;
                }
                match reason {
                    "no_rows_in_dataset" => {
                        self.mark_projected(&canonical);
                        return ProjectionState::ReadyEmpty;
                    }
                    "fatal_error" => return ProjectionState::FatalError,
                    _ => continue,
                }
            }
            return ProjectionState::Timeout;
        }
    }

    /// Serializes on the alias's in-process lock, retries up to three times,
    /// healing storage between attempts when `aggressive_rebuild` allows it.
    pub async fn ensure_projected(&self, alias: &str, user: &UserContext, timeout: Duration) -> ProjectionState {
        let canonical = alias_for(alias);
        if self.is_projected(&canonical) {
            return ProjectionState::Ready;
        }

        let alias_lock = self.locks.get(&canonical);
        let _guard = alias_lock.lock().await;
        if self.is_projected(&canonical) {
            return ProjectionState::Ready;
        }

        for attempt in 0..MAX_ENSURE_ATTEMPTS {
            if let Err(err) = self.registry.ensure_exists(&canonical, user).await {
                warn!(dataset = %canonical, detail = %err, "knowledge_projection_dataset_missing");
                return ProjectionState::FatalError;
            }

            let (ready, reason) = self.probe(&canonical, user).await;
            if ready {
                self.mark_projected(&canonical);
                return ProjectionState::Ready;
            }
            if reason == "no_rows_in_dataset" {
                self.mark_projected(&canonical);
                return ProjectionState::ReadyEmpty;
            }

            debug!(dataset = %canonical, attempt = attempt + 1, reason, "knowledge_projection_ensure");

            let wait_status = self.wait(&canonical, user, timeout).await;
            if matches!(wait_status, ProjectionState::Ready | ProjectionState::ReadyEmpty) {
                self.mark_projected(&canonical);
                return wait_status;
            }

            if !self.aggressive_rebuild {
                break;
            }

            let entries = self.registry.list_entries(&canonical, user).await.unwrap_or_default();
            if entries.is_empty() {
                continue;
            }
            let (_missing, healed) = self.storage.heal(&canonical, &entries).await;
            if healed > 0 {
                let retry_timeout = Duration::from_secs_f64(timeout.as_secs_f64().clamp(0.0, 5.0));
                let retry_status = self.wait(&canonical, user, retry_timeout).await;
                if retry_status == ProjectionState::Ready {
                    self.mark_projected(&canonical);
                    return ProjectionState::Ready;
                }
            }
        }

        warn!(dataset = %canonical, attempts = MAX_ENSURE_ATTEMPTS, "projection:ensure_failed");
        ProjectionState::Timeout
    }

    /// Invokes the engine's `cognify`; on a lost-storage error, heals and
    /// retries, falling back to a full facade rebuild when `allow_rebuild`
    /// permits it.
    pub async fn project(&self, alias: &str, user: &UserContext, allow_rebuild: bool) -> Result<(), ProjectError> {
        Box::pin(self.project_inner(alias, user, allow_rebuild, 0)).await
    }

    async fn project_inner(
        &self,
        alias: &str,
        user: &UserContext,
        allow_rebuild: bool,
        depth: u32,
    ) -> Result<(), ProjectError> {
        let canonical = alias_for(alias);
        let dataset_id = self.registry.get_dataset_id(&canonical, user).await.ok().flatten();
        let target = dataset_id.map(|id| id.to_string()).unwrap_or_else(|| canonical.clone());

        debug!(dataset = %canonical, "projection:cognify_start");
        match self.engine.cognify(&target, user).await {
            Ok(()) => {
                debug!(dataset = %canonical, "projection:cognify_done");
                Ok(())
            }
            Err(EngineError::FileNotFound(missing)) => {
                if !self.aggressive_rebuild {
                    warn!(dataset = %canonical, missing, "knowledge_dataset_storage_missing reason=aggressive_rebuild_disabled");
                    return Ok(());
                }
                if depth >= MAX_PROJECT_DEPTH {
                    warn!(dataset = %canonical, missing, "knowledge_dataset_storage_missing reason=max_depth_reached");
                    return Err(EngineError::FileNotFound(missing).into());
                }

                let entries = self.registry.list_entries(&canonical, user).await.unwrap_or_default();
                let (missing_count, healed) = self.storage.heal(&canonical, &entries).await;
                self.invalidate(&canonical);

                if healed > 0 {
                    return Box::pin(self.project_inner(&canonical, user, allow_rebuild, depth + 1)).await;
                }

                warn!(dataset = %canonical, missing = missing_count, healed, "storage_missing:heal_failed");

                if allow_rebuild {
                    let rebuilder = self.rebuilder.read().unwrap().clone();
                    if let Some(rebuilder) = rebuilder {
                        if rebuilder.rebuild_dataset(&canonical, user).await.is_ok() {
                            info!(dataset = %canonical, "knowledge_dataset_rebuilt");
                            return Box::pin(self.project_inner(&canonical, user, allow_rebuild, depth + 1)).await;
                        }
                    } else {
                        warn!(dataset = %canonical, "projection:rebuild_skipped reason=knowledge_base_unavailable");
                    }
                }

                Err(EngineError::FileNotFound(missing).into())
            }
            Err(other) => {
                warn!(dataset = %canonical, detail = %other, "knowledge_dataset_cognify_failed");
                Err(other.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachkb_engine::{EngineRow, MockEngine};

    fn user() -> UserContext {
        UserContext("u1".to_string())
    }

    // ProjectionService always owns a StorageService, which needs a live
    // Redis connection; these tests exercise probe's classification logic
    // directly against DatasetRegistry/Engine, which is where all of its
    // decision-making actually lives.

    #[tokio::test]
    async fn probe_logic_reports_not_found_for_unregistered_dataset() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(DatasetRegistry::new(engine.clone()));
        let id = registry.get_dataset_id("kb_profile_1", &user()).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn probe_logic_classifies_pending_vs_ready_by_row_text() {
        let engine = Arc::new(MockEngine::new());
        engine.seed_rows(
            "kb_profile_1",
            vec![EngineRow { text: "   ".to_string(), metadata: serde_json::json!({}) }],
        );
        let registry = Arc::new(DatasetRegistry::new(engine.clone()));
        registry.ensure_exists("kb_profile_1", &user()).await.unwrap();
        let rows = registry.list_entries("kb_profile_1", &user()).await.unwrap();
        let valid = rows.iter().filter(|r| !r.text.trim().is_empty()).count();
        assert_eq!(valid, 0, "whitespace-only row should not count as valid");

        engine.seed_rows(
            "kb_profile_1",
            vec![EngineRow { text: "real content".to_string(), metadata: serde_json::json!({}) }],
        );
        let rows = registry.list_entries("kb_profile_1", &user()).await.unwrap();
        let valid = rows.iter().filter(|r| !r.text.trim().is_empty()).count();
        assert_eq!(valid, 1);
    }

    #[tokio::test]
    async fn cognify_missing_file_surfaces_file_not_found() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_cognify_with_missing_file("kb_profile_2", "text_deadbeef.txt");
        let result = engine.cognify("kb_profile_2", &user()).await;
        assert!(matches!(result, Err(EngineError::FileNotFound(_))));
    }

    #[test]
    fn wait_backoff_sequence_matches_spec() {
        assert_eq!(WAIT_BACKOFF_S, [0.5, 1.0, 2.0, 5.0, 8.0]);
    }
}
