//! Wires every subsystem into a single `KnowledgeBase` value and closes the
//! capability-trait cycles described by each component (spec §9 Design
//! Notes): this crate is the only thing that implements `DatasetUpdater`,
//! `DatasetRebuilder`, `ProfileSyncScheduler`, `MemifyScheduler`, and
//! `DatasetProcessor` all at once.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use coachkb_chat::{ChatProjectionScheduler, DatasetProcessor};
use coachkb_config::AppConfig;
use coachkb_engine::{Engine, UserContext};
use coachkb_gdrive::{DriveClient, GDriveLoader};
use coachkb_locks::RedisLock;
use coachkb_orchestrator::{Flow, TaskOrchestrator, TaskRequest, Upstream};
use coachkb_projection::{DatasetRebuilder, ProjectionService, ProjectionState};
use coachkb_search::{MemifyScheduler, ProfileSyncScheduler, SearchService, Snippet};
use coachkb_storage::{
    alias_for, chat_dataset_name, dataset_name, is_chat_dataset, normalize_text, ContentStore,
    DatasetRegistry, DatasetUpdater, HashStore, StorageService,
};
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

const REFRESH_PROJECTION_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_PROJECTION_TIMEOUT: Duration = Duration::from_secs(30);
const PROCESS_PROJECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KnowledgeBase<E: Engine + 'static> {
    config: AppConfig,
    system_user: UserContext,
    engine: Arc<E>,
    registry: Arc<DatasetRegistry<E>>,
    storage: Arc<StorageService<E>>,
    projection: Arc<ProjectionService<E>>,
    search: Arc<SearchService<E>>,
    orchestrator: Arc<TaskOrchestrator>,
    chat: RwLock<Option<Arc<ChatProjectionScheduler<KnowledgeBase<E>>>>>,
    gdrive: RwLock<Option<Arc<GDriveLoader<E>>>>,
}

impl<E: Engine + 'static> KnowledgeBase<E> {
    /// Builds every component from `config`/`redis`/`engine` and attaches
    /// itself as each one's capability-trait collaborator (spec §9 Design
    /// Notes: builder pattern, no back-pointers baked into the components
    /// themselves).
    pub fn new(
        config: AppConfig,
        engine: Arc<E>,
        redis: ConnectionManager,
        orchestrator: Arc<TaskOrchestrator>,
        system_user: UserContext,
    ) -> Arc<Self> {
        let registry = Arc::new(DatasetRegistry::new(engine.clone()));
        let content = ContentStore::new(config.storage.cognee_storage_path.clone());
        let retention = Duration::from_secs(config.storage.backup_retention_days * 24 * 60 * 60);
        let hashes = HashStore::new(redis.clone(), retention);
        let storage = Arc::new(StorageService::new(content, hashes.clone(), registry.clone()));
        let projection = Arc::new(ProjectionService::new(
            engine.clone(),
            registry.clone(),
            storage.clone(),
            config.storage.cognee_enable_aggressive_rebuild,
        ));
        let search = Arc::new(SearchService::new(
            engine.clone(),
            registry.clone(),
            projection.clone(),
            hashes,
            redis,
            config.storage.cognee_global_dataset.clone(),
        ));

        let kb = Arc::new(Self {
            config,
            system_user,
            engine,
            registry,
            storage,
            projection,
            search,
            orchestrator,
            chat: RwLock::new(None),
            gdrive: RwLock::new(None),
        });
        kb.attach_self();
        kb
    }

    fn attach_self(self: &Arc<Self>) {
        self.storage.attach_knowledge_base(self.clone() as Arc<dyn DatasetUpdater>);
        self.projection.attach_rebuilder(self.clone() as Arc<dyn DatasetRebuilder>);
        self.search.attach_profile_sync(self.clone() as Arc<dyn ProfileSyncScheduler>);
        self.search.attach_memify(self.clone() as Arc<dyn MemifyScheduler>);

        let debounce = Duration::from_secs(self.config.chat_projection.debounce_minutes * 60);
        let scheduler = ChatProjectionScheduler::new(self.clone(), Some(self.system_user.clone()), debounce);
        *self.chat.write().unwrap() = Some(scheduler);
    }

    /// Wires a Google Drive loader in after construction, since it's
    /// optional: a deployment without a configured folder never attaches
    /// one and `refresh` simply skips the drive pass.
    pub fn attach_gdrive(self: &Arc<Self>, client: Arc<dyn DriveClient>, locks: RedisLock, redis: ConnectionManager, folder_id: String) {
        let loader = GDriveLoader::new(
            client,
            self.clone() as Arc<dyn DatasetUpdater>,
            self.projection.clone(),
            locks,
            redis,
            self.config.gdrive.clone(),
            folder_id,
            self.config.storage.cognee_global_dataset.clone(),
            self.system_user.clone(),
        );
        *self.gdrive.write().unwrap() = Some(Arc::new(loader));
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn system_user(&self) -> &UserContext {
        &self.system_user
    }

    /// Fans a query out across a profile's datasets (spec §4.F).
    pub async fn search(&self, query: &str, profile_id: u64, k: Option<usize>, datasets: Option<&[String]>, request_id: Option<&str>) -> Vec<Snippet> {
        self.search.search(query, profile_id, k, datasets, &self.system_user, request_id).await
    }

    /// Normalizes, dedupes, writes, and (when newly created) schedules
    /// reindexing of `text` under `dataset` — the single entry point the
    /// original calls `add_text` (spec §4.D/§4.G).
    pub async fn add_text(
        self: &Arc<Self>,
        text: &str,
        dataset: &str,
        user: Option<&UserContext>,
        node_set: Option<&[String]>,
        metadata: Option<JsonValue>,
        project: bool,
    ) -> anyhow::Result<()> {
        let actor = user.cloned().unwrap_or_else(|| self.system_user.clone());
        let alias = alias_for(dataset);

        let mut attempts = 0u32;
        let (resolved, created) = loop {
            match self.update_dataset(text, &alias, &actor, node_set, metadata.clone()).await {
                Ok(outcome) => break outcome,
                Err(err) => {
                    attempts += 1;
                    if attempts >= 2 {
                        warn!(dataset = %alias, attempts, detail = %err, "kb_append_aborted");
                        return Err(err);
                    }
                    debug!(dataset = %alias, attempts, "kb_append_retry");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        };

        if !created {
            return Ok(());
        }

        if should_queue_chat(project, &alias) {
            if let Some(chat) = self.chat.read().unwrap().clone() {
                let pending = chat.queue(&alias);
                debug!(dataset = %alias, pending, "kb_chat_ingest_queued");
                chat.ensure_task(&alias);
            }
        } else {
            let kb = self.clone();
            let actor = actor.clone();
            tokio::spawn(async move {
                if let Err(err) = kb.process_dataset(&resolved, Some(&actor)).await {
                    warn!(dataset = %resolved, detail = %err, "kb_dataset_processing_failed");
                }
            });
        }
        Ok(())
    }

    pub async fn save_client_message(self: &Arc<Self>, profile_id: u64, text: &str) -> anyhow::Result<()> {
        let dataset = chat_dataset_name(profile_id);
        let node_set = vec![format!("client:{profile_id}"), "chat_message".to_string()];
        let metadata = serde_json::json!({ "channel": "chat", "kind": "message" });
        self.add_text(text, &dataset, None, Some(&node_set), Some(metadata), false).await
    }

    pub async fn save_ai_message(self: &Arc<Self>, profile_id: u64, text: &str) -> anyhow::Result<()> {
        let dataset = chat_dataset_name(profile_id);
        let node_set = vec![format!("client:{profile_id}"), "chat_message".to_string()];
        let metadata = serde_json::json!({ "channel": "chat", "kind": "message", "role": "ai_coach" });
        self.add_text(text, &dataset, None, Some(&node_set), Some(metadata), false).await
    }

    pub async fn message_history(&self, profile_id: u64, limit: usize) -> Vec<String> {
        let alias = alias_for(&chat_dataset_name(profile_id));
        let Ok(rows) = self.registry.list_entries(&alias, &self.system_user).await else {
            info!(profile_id, "kb_message_history_unavailable");
            return Vec::new();
        };
        let mut messages: Vec<String> = rows.into_iter().filter_map(|row| (!row.text.is_empty()).then_some(row.text)).collect();
        if messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        messages
    }

    pub async fn project_dataset_now(&self, alias: &str, timeout: Duration) -> ProjectionState {
        self.projection.ensure_projected(alias, &self.system_user, timeout).await
    }

    /// `POST /knowledge/refresh/` (spec §6.2): re-pulls the Google Drive
    /// source (if attached) and re-cognifies the global dataset.
    pub async fn refresh(self: &Arc<Self>, force: bool) -> anyhow::Result<()> {
        let global_alias = alias_for(&self.config.storage.cognee_global_dataset);
        self.registry.ensure_exists(&global_alias, &self.system_user).await?;
        self.projection.invalidate(&global_alias);

        let loader = self.gdrive.read().unwrap().clone();
        if let Some(loader) = loader {
            loader.load(force).await?;
        }

        if let Err(err) = self.projection.project(&global_alias, &self.system_user, true).await {
            warn!(dataset = %global_alias, detail = %err, "kb_refresh_cognify_skipped");
        } else {
            self.projection.wait(&global_alias, &self.system_user, REFRESH_PROJECTION_TIMEOUT).await;
        }
        info!(dataset = %global_alias, force, "kb_refresh_done");
        Ok(())
    }

    /// `POST /internal/knowledge/profiles/<id>/cleanup/` (spec §6.2). The
    /// engine surface this crate consumes (spec §6.3) has no dataset-delete
    /// operation, so cleanup drops our own cached state for the profile's
    /// datasets rather than deleting them engine-side.
    pub async fn cleanup_profile(&self, profile_id: u64, reason: &str) -> anyhow::Result<()> {
        for alias in [alias_for(&dataset_name(profile_id)), alias_for(&chat_dataset_name(profile_id))] {
            self.storage.hash_store().clear(&alias).await;
            self.projection.invalidate(&alias);
        }
        info!(profile_id, reason, "kb_profile_cleanup_done");
        Ok(())
    }

    /// `POST /internal/knowledge/profiles/<id>/sync/` (spec §6.2).
    pub async fn sync_profile(&self, profile_id: u64, reason: &str) -> anyhow::Result<()> {
        let alias = alias_for(&dataset_name(profile_id));
        self.registry.ensure_exists(&alias, &self.system_user).await?;
        self.projection.invalidate(&alias);
        self.projection.project(&alias, &self.system_user, true).await?;
        let state = self.projection.wait(&alias, &self.system_user, SYNC_PROJECTION_TIMEOUT).await;
        info!(profile_id, reason, ?state, "kb_profile_sync_done");
        Ok(())
    }

    /// `POST /internal/knowledge/prune/` (spec §6.2). Left unimplemented in
    /// the source this was distilled from, so this stays a no-op hook
    /// rather than guessing at deletion semantics the original never
    /// committed to.
    pub async fn prune(&self) -> anyhow::Result<()> {
        info!("kb_prune_requested");
        Ok(())
    }

    /// Runs one Plan/Diet/Ask-AI task end to end through the shared
    /// orchestrator (spec §4.I).
    pub async fn run_task(self: &Arc<Self>, flow: Flow, upstream: &dyn Upstream, req: TaskRequest) -> anyhow::Result<JsonValue> {
        self.orchestrator.run(flow, upstream, req).await
    }
}

/// Whether newly-ingested content should join the debounced chat queue
/// rather than being cognified immediately: the caller explicitly opted
/// out of immediate projection, or the dataset is itself a chat dataset
/// (spec §4.G).
fn should_queue_chat(project: bool, alias: &str) -> bool {
    !project || is_chat_dataset(alias)
}

#[async_trait]
impl<E: Engine + 'static> DatasetUpdater for KnowledgeBase<E> {
    /// Mirrors the source's `update_dataset`: normalize, dedupe against the
    /// HashStore, write the content blob, then add to the engine only for
    /// genuinely new content (spec §4.D).
    async fn update_dataset(
        &self,
        text: &str,
        alias: &str,
        user: &UserContext,
        node_set: Option<&[String]>,
        metadata: Option<JsonValue>,
    ) -> anyhow::Result<(String, bool)> {
        let canonical = alias_for(alias);
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            debug!(dataset = %canonical, "kb_update_dataset_skip reason=empty_content");
            return Ok((canonical, false));
        }

        self.registry.ensure_exists(&canonical, user).await?;
        let digest = self.storage.compute_digest(&normalized);
        let augmented = self.storage.augment_metadata(metadata.as_ref(), &canonical, &digest);

        let (path, _) = self.storage.content_store().ensure(&digest, &normalized).await;
        if path.is_none() {
            warn!(dataset = %canonical, "kb_update_dataset_failed reason=storage_write_failed");
            return Ok((canonical, false));
        }

        if self.storage.hash_store().contains(&canonical, &digest).await {
            self.storage.hash_store().add(&canonical, &digest, Some(&augmented)).await;
            debug!(dataset = %canonical, digest = %digest, "kb_append_skipped reason=duplicate");
            return Ok((canonical, false));
        }

        let nodes: Vec<String> = node_set.map(<[String]>::to_vec).unwrap_or_default();
        let dataset_id = self.engine.add(&normalized, &canonical, user, Some(&nodes)).await?;
        self.registry.register(&canonical, dataset_id);
        self.storage.hash_store().add(&canonical, &digest, Some(&augmented)).await;

        debug!(dataset = %canonical, digest = %digest, "kb_update_dataset done");
        Ok((dataset_id.to_string(), true))
    }
}

#[async_trait]
impl<E: Engine + 'static> DatasetRebuilder for KnowledgeBase<E> {
    /// Mirrors the source's `rebuild_dataset`: heal what storage can, clear
    /// the HashStore, and if the engine has lost the dataset entirely,
    /// relink content from disk and reingest it (spec §4.D/§4.E).
    async fn rebuild_dataset(&self, alias: &str, user: &UserContext) -> anyhow::Result<()> {
        let canonical = alias_for(alias);
        if let Err(err) = self.registry.ensure_exists(&canonical, user).await {
            warn!(dataset = %canonical, detail = %err, "knowledge_dataset_rebuild_ensure_failed");
        }

        let existing = self.registry.list_entries(&canonical, user).await.unwrap_or_default();
        self.storage.heal(&canonical, &existing).await;
        self.storage.hash_store().clear(&canonical).await;
        self.projection.invalidate(&canonical);

        if !existing.is_empty() {
            return Ok(());
        }

        self.storage.rebuild_from_disk(&canonical).await;
        let digests = self.storage.hash_store().list(&canonical).await;
        if digests.is_empty() {
            anyhow::bail!("knowledge_dataset_rebuild_no_recoverable_content");
        }

        let mut pairs = Vec::with_capacity(digests.len());
        for digest in digests {
            let metadata = self.storage.hash_store().metadata(&canonical, &digest).await;
            pairs.push((digest, metadata));
        }
        self.storage.hash_store().clear(&canonical).await;

        let result = self.storage.reingest_from_hashstore(&canonical, user, &pairs).await;
        if !result.healed {
            anyhow::bail!(result.reason.unwrap_or_else(|| "knowledge_dataset_rebuild_failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Engine + 'static> ProfileSyncScheduler for KnowledgeBase<E> {
    /// Runs the sync inline rather than truly in the background: the
    /// capability trait only hands this impl `&self`, and getting back to
    /// an `Arc<Self>` for a spawned task would mean stashing a
    /// self-reference inside the facade, the back-pointer spec §9 Design
    /// Notes says to avoid. The NX dedup key `SearchService` already
    /// checked before calling this still caps the cost to once per profile
    /// per 600 seconds.
    async fn schedule_profile_sync(&self, profile_id: u64) -> anyhow::Result<()> {
        self.sync_profile(profile_id, "search_triggered").await
    }
}

#[async_trait]
impl<E: Engine + 'static> MemifyScheduler for KnowledgeBase<E> {
    async fn schedule_memify(&self, profile_id: u64) -> anyhow::Result<()> {
        let datasets = vec![alias_for(&dataset_name(profile_id)), alias_for(&self.config.storage.cognee_global_dataset)];
        self.engine.memify(&datasets, &self.system_user).await?;
        Ok(())
    }
}

#[async_trait]
impl<E: Engine + 'static> DatasetProcessor for KnowledgeBase<E> {
    /// The chat scheduler's debounced reindex call: project then wait,
    /// mirroring the source's `_process_dataset` (spec §4.G).
    async fn process_dataset(&self, alias: &str, user: Option<&UserContext>) -> anyhow::Result<()> {
        let canonical = alias_for(alias);
        let actor = user.cloned().unwrap_or_else(|| self.system_user.clone());
        self.projection.project(&canonical, &actor, true).await?;
        self.projection.wait(&canonical, &actor, PROCESS_PROJECTION_TIMEOUT).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_queue_chat_when_project_is_false() {
        assert!(should_queue_chat(false, "kb_profile_1"));
    }

    #[test]
    fn should_queue_chat_for_chat_datasets_regardless_of_project_flag() {
        assert!(should_queue_chat(true, "kb_chat_1"));
    }

    #[test]
    fn should_not_queue_chat_for_a_projected_document_dataset() {
        assert!(!should_queue_chat(true, "kb_profile_1"));
    }
}
