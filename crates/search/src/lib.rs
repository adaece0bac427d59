//! Fans a query out across a profile's datasets, falls back to raw
//! documents when nothing is projected yet, and deduplicates hits (spec
//! §4.F).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coachkb_engine::{Engine, QueryType, UserContext};
use coachkb_projection::ProjectionService;
use coachkb_storage::{alias_for, chat_dataset_name, dataset_name, DatasetRegistry, HashStore};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

const GLOBAL_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const DATASET_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_TOP_K: usize = 10;
const DEFAULT_FALLBACK_LIMIT: usize = 6;
const PROFILE_SYNC_TTL_S: u64 = 600;
const MEMIFY_DEDUP_TTL_S: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetKind {
    Document,
    Note,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Snippet {
    pub text: String,
    pub dataset: Option<String>,
    pub kind: SnippetKind,
}

/// Hooked by `coachkb-orchestrator` so search can trigger background work
/// without depending on the task-queue crate (spec §9 Design Notes).
#[async_trait]
pub trait ProfileSyncScheduler: Send + Sync {
    async fn schedule_profile_sync(&self, profile_id: u64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MemifyScheduler: Send + Sync {
    async fn schedule_memify(&self, profile_id: u64) -> anyhow::Result<()>;
}

pub struct SearchService<E: Engine> {
    engine: Arc<E>,
    registry: Arc<DatasetRegistry<E>>,
    projection: Arc<ProjectionService<E>>,
    hashes: HashStore,
    redis: ConnectionManager,
    global_dataset: String,
    profile_sync: std::sync::RwLock<Option<Arc<dyn ProfileSyncScheduler>>>,
    memify: std::sync::RwLock<Option<Arc<dyn MemifyScheduler>>>,
}

impl<E: Engine> SearchService<E> {
    pub fn new(
        engine: Arc<E>,
        registry: Arc<DatasetRegistry<E>>,
        projection: Arc<ProjectionService<E>>,
        hashes: HashStore,
        redis: ConnectionManager,
        global_dataset: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            projection,
            hashes,
            redis,
            global_dataset: global_dataset.into(),
            profile_sync: std::sync::RwLock::new(None),
            memify: std::sync::RwLock::new(None),
        }
    }

    pub fn attach_profile_sync(&self, scheduler: Arc<dyn ProfileSyncScheduler>) {
        *self.profile_sync.write().unwrap() = Some(scheduler);
    }

    pub fn attach_memify(&self, scheduler: Arc<dyn MemifyScheduler>) {
        *self.memify.write().unwrap() = Some(scheduler);
    }

    fn session_id_for_profile(profile_id: u64) -> String {
        format!("profile:{profile_id}")
    }

    fn build_candidate_aliases(&self, datasets: Option<&[String]>, profile_id: u64) -> Vec<String> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |alias: String, seen: &mut HashSet<String>, candidates: &mut Vec<String>| {
            if seen.insert(alias.clone()) {
                candidates.push(alias);
            }
        };

        if let Some(datasets) = datasets {
            for name in datasets {
                push(alias_for(name), &mut seen, &mut candidates);
            }
            return candidates;
        }

        push(alias_for(&dataset_name(profile_id)), &mut seen, &mut candidates);
        push(alias_for(&chat_dataset_name(profile_id)), &mut seen, &mut candidates);
        push(alias_for(&self.global_dataset), &mut seen, &mut candidates);
        candidates
    }

    /// Drops the global alias from the candidate list if it can't be made
    /// ready within a very small budget, so one cold global dataset never
    /// stalls every search.
    async fn ensure_global_ready(&self, candidates: Vec<String>, user: &UserContext) -> Vec<String> {
        let global_alias = alias_for(&self.global_dataset);
        if !candidates.contains(&global_alias) || self.projection.is_projected(&global_alias) {
            return candidates;
        }

        let status = self.projection.ensure_projected(&global_alias, user, GLOBAL_PROBE_TIMEOUT).await;
        if matches!(status, coachkb_projection::ProjectionState::Ready | coachkb_projection::ProjectionState::ReadyEmpty)
        {
            return candidates;
        }
        debug!(dataset = %global_alias, "knowledge_search_global_pending");
        candidates.into_iter().filter(|alias| alias != &global_alias).collect()
    }

    async fn schedule_profile_sync(&self, profile_id: u64) {
        let key = format!("ai_coach:profile_sync:{profile_id}");
        let mut conn = self.redis.clone();
        let claimed: Result<bool, _> = conn
            .set_options(
                &key,
                "1",
                redis::SetOptions::default()
                    .with_expiration(redis::SetExpiry::EX(PROFILE_SYNC_TTL_S))
                    .conditional_set(redis::ExistenceCheck::NX),
            )
            .await;
        let Ok(true) = claimed else { return };
        let scheduler = self.profile_sync.read().unwrap().clone();
        if let Some(scheduler) = scheduler {
            if let Err(err) = scheduler.schedule_profile_sync(profile_id).await {
                warn!(profile_id, detail = %err, "profile_sync_enqueue_failed");
            } else {
                debug!(profile_id, "profile_sync_enqueued");
            }
        }
    }

    async fn maybe_schedule_memify(&self, profile_id: u64) {
        let key = format!("memify:profile:{profile_id}");
        let mut conn = self.redis.clone();
        let claimed: Result<bool, _> = conn
            .set_options(
                &key,
                "1",
                redis::SetOptions::default()
                    .with_expiration(redis::SetExpiry::EX(MEMIFY_DEDUP_TTL_S))
                    .conditional_set(redis::ExistenceCheck::NX),
            )
            .await;
        let Ok(true) = claimed else { return };
        let scheduler = self.memify.read().unwrap().clone();
        if let Some(scheduler) = scheduler {
            if let Err(err) = scheduler.schedule_memify(profile_id).await {
                warn!(profile_id, detail = %err, "knowledge_memify_schedule_failed");
            }
        }
    }

    pub async fn search(
        &self,
        query: &str,
        profile_id: u64,
        k: Option<usize>,
        datasets: Option<&[String]>,
        user: &UserContext,
        _request_id: Option<&str>,
    ) -> Vec<Snippet> {
        let normalized = query.trim();
        if normalized.is_empty() {
            return Vec::new();
        }

        self.schedule_profile_sync(profile_id).await;
        let session_id = Self::session_id_for_profile(profile_id);

        let candidates = self.build_candidate_aliases(datasets, profile_id);
        let candidates = self.ensure_global_ready(candidates, user).await;
        if candidates.is_empty() {
            debug!(profile_id, "knowledge_search_skipped reason=no_datasets");
            return Vec::new();
        }

        for alias in &candidates {
            if let Err(err) = self.registry.ensure_exists(alias, user).await {
                debug!(dataset = %alias, detail = %err, "knowledge_dataset_ensure_failed");
            }
        }

        let aggregated = self.search_single_query(normalized, &candidates, user, k, &session_id).await;

        self.maybe_schedule_memify(profile_id).await;

        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for snippet in aggregated {
            let cleaned = snippet.text.trim();
            if cleaned.is_empty() {
                continue;
            }
            let key = cleaned.to_lowercase();
            if seen.insert(key) {
                deduped.push(snippet);
            }
            if let Some(k) = k {
                if deduped.len() >= k {
                    break;
                }
            }
        }
        if let Some(k) = k {
            deduped.truncate(k);
        }
        deduped
    }

    async fn search_single_query(
        &self,
        query: &str,
        candidates: &[String],
        user: &UserContext,
        k: Option<usize>,
        session_id: &str,
    ) -> Vec<Snippet> {
        let mut ready = Vec::new();
        let mut had_rows = false;

        for alias in candidates {
            let row_count = self.registry.row_count(alias, user).await.unwrap_or(0);
            if row_count == 0 {
                debug!(dataset = %alias, "projection:skip_no_rows");
                continue;
            }
            had_rows = true;

            if self.projection.is_projected(alias) {
                ready.push(alias.clone());
                continue;
            }
            let status = self.projection.ensure_projected(alias, user, DATASET_PROBE_TIMEOUT).await;
            if matches!(status, coachkb_projection::ProjectionState::Ready | coachkb_projection::ProjectionState::ReadyEmpty) {
                ready.push(alias.clone());
            } else {
                debug!(dataset = %alias, "knowledge_projection_ensure_failed");
            }
        }

        if ready.is_empty() {
            if had_rows {
                let limit = k.unwrap_or(DEFAULT_FALLBACK_LIMIT);
                return self.fallback_dataset_entries(candidates, user, limit).await;
            }
            return Vec::new();
        }

        let top_k = k.unwrap_or(DEFAULT_TOP_K);
        let mut hits = self
            .engine
            .search(query, &ready, user, Some(session_id), top_k, QueryType::GraphCompletionContextExtension)
            .await
            .unwrap_or_default();

        if hits.is_empty() {
            tokio::time::sleep(RETRY_DELAY).await;
            let retry = self.engine.search(query, &ready, user, None, top_k, QueryType::GraphCompletionContextExtension).await.unwrap_or_default();
            if !retry.is_empty() {
                hits = retry;
            }
        }

        self.build_snippets(hits, &ready).await
    }

    async fn build_snippets(&self, hits: Vec<coachkb_engine::SearchHit>, ready: &[String]) -> Vec<Snippet> {
        let mut snippets = Vec::with_capacity(hits.len());
        for hit in hits {
            let normalized = coachkb_storage::normalize_text(&hit.text);
            if normalized.is_empty() {
                continue;
            }

            let mut metadata = hit.metadata.as_object().cloned().unwrap_or_default();
            let mut dataset = metadata.get("dataset").and_then(|v| v.as_str()).map(str::to_string);

            if dataset.is_none() {
                let digest = HashStore::digest_for_text(&normalized);
                for candidate in ready {
                    if let Some(found) = self.hashes.metadata(candidate, &digest).await {
                        if let Some(obj) = found.as_object() {
                            for (k, v) in obj {
                                metadata.entry(k.clone()).or_insert_with(|| v.clone());
                            }
                        }
                        dataset = Some(candidate.clone());
                        break;
                    }
                }
                if dataset.is_none() {
                    dataset = ready.first().cloned();
                }
                if let Some(alias) = &dataset {
                    metadata.insert("dataset".to_string(), JsonValue::String(alias.clone()));
                    let digest = digest.clone();
                    self.hashes.add(alias, &digest, Some(&JsonValue::Object(metadata.clone()))).await;
                }
            }

            let kind = resolve_kind(&metadata);
            snippets.push(Snippet { text: hit.text, dataset, kind });
        }
        snippets
    }

    /// Reads documents straight from the engine's row listing when no
    /// dataset could be made search-ready, skipping message rows.
    async fn fallback_dataset_entries(&self, candidates: &[String], user: &UserContext, limit: usize) -> Vec<Snippet> {
        let mut collected = Vec::new();
        for alias in candidates {
            let Ok(rows) = self.registry.list_entries(alias, user).await else { continue };
            for row in rows {
                let normalized = coachkb_storage::normalize_text(&row.text);
                if normalized.is_empty() {
                    continue;
                }
                let kind_value = row.metadata.get("kind").and_then(|v| v.as_str());
                if kind_value == Some("message") {
                    continue;
                }
                collected.push(Snippet { text: normalized, dataset: Some(alias.clone()), kind: SnippetKind::Document });
                if collected.len() >= limit {
                    return collected;
                }
            }
        }
        collected
    }
}

fn resolve_kind(metadata: &Map<String, JsonValue>) -> SnippetKind {
    match metadata.get("kind").and_then(|v| v.as_str()) {
        Some("document") => SnippetKind::Document,
        Some("note") | Some("message") => SnippetKind::Note,
        Some(_) => SnippetKind::Unknown,
        None => SnippetKind::Document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_kind_remaps_message_to_note() {
        let mut metadata = Map::new();
        metadata.insert("kind".to_string(), JsonValue::String("message".to_string()));
        assert_eq!(resolve_kind(&metadata), SnippetKind::Note);
    }

    #[test]
    fn resolve_kind_defaults_to_document_when_absent() {
        assert_eq!(resolve_kind(&Map::new()), SnippetKind::Document);
    }

    #[test]
    fn resolve_kind_falls_back_to_unknown_for_unrecognized_values() {
        let mut metadata = Map::new();
        metadata.insert("kind".to_string(), JsonValue::String("summary".to_string()));
        assert_eq!(resolve_kind(&metadata), SnippetKind::Unknown);
    }

    #[test]
    fn session_id_is_deterministic_per_profile() {
        assert_eq!(SearchService::<coachkb_engine::MockEngine>::session_id_for_profile(42), "profile:42");
    }
}
