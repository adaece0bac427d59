//! Scans a configured Google Drive folder and ingests its documents into
//! the shared dataset (spec §4.H).

pub mod client;
pub mod parsers;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use client::{is_folder_mime, join_kb_path, DriveClient, DriveError, DriveItem, DriveListPage};
use coachkb_config::GDriveConfig;
use coachkb_engine::{Engine, UserContext};
use coachkb_locks::RedisLock;
use coachkb_projection::ProjectionService;
use coachkb_storage::{alias_for, normalize_text, sanitize_text, DatasetUpdater};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const LOCK_KEY: &str = "locks:kb_gdrive_load";
const LOCK_TTL: Duration = Duration::from_secs(5 * 60);
const PROJECTION_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Running,
    Skipped,
    Done,
    Partial,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub status: LoadStatus,
    pub dataset: String,
    pub dataset_alias: String,
    pub folder_id: String,
    pub files_total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub current: Option<String>,
    pub reason: Option<String>,
    pub fingerprint: Option<String>,
}

impl LoadSummary {
    fn starting(dataset: &str, dataset_alias: &str, folder_id: &str) -> Self {
        Self {
            status: LoadStatus::Running,
            dataset: dataset.to_string(),
            dataset_alias: dataset_alias.to_string(),
            folder_id: folder_id.to_string(),
            files_total: 0,
            processed: 0,
            skipped: 0,
            errors: 0,
            current: None,
            reason: None,
            fingerprint: None,
        }
    }
}

/// DFS over a Drive folder tree, assembling a POSIX-style `kb_path` for
/// each file relative to the scanned root. A `visited` set guards against
/// cyclic folder structure (shared/shortcut folders can reference an
/// ancestor).
pub async fn scan_tree(client: &dyn DriveClient, root_folder_id: &str) -> Result<Vec<(DriveItem, String, String)>, DriveError> {
    let mut pending = vec![(root_folder_id.to_string(), String::new())];
    let mut visited = HashSet::new();
    let mut collected = Vec::new();

    while let Some((folder_id, prefix)) = pending.pop() {
        if !visited.insert(folder_id.clone()) {
            continue;
        }

        let mut page_token: Option<String> = None;
        loop {
            let page = client.list_children(&folder_id, page_token.as_deref()).await?;
            for item in page.items {
                let name = item.name.trim().to_string();
                if name.is_empty() {
                    continue;
                }
                if item.is_folder {
                    if !item.id.trim().is_empty() {
                        pending.push((item.id.clone(), join_kb_path(&prefix, &name)));
                    }
                    continue;
                }
                let kb_path = join_kb_path(&prefix, &name);
                let kb_folder_path = prefix.clone();
                collected.push((item, kb_path, kb_folder_path));
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
    }

    Ok(collected)
}

fn retry_delay(config: &GDriveConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = config.download_initial_delay_s * config.download_backoff_factor.powi(exponent as i32);
    Duration::from_secs_f64(delay.min(config.download_max_delay_s))
}

/// Downloads one file, retrying retryable failures with exponential
/// backoff up to `config.download_max_retries` attempts.
pub async fn download_with_retry(
    client: &dyn DriveClient,
    file_id: &str,
    config: &GDriveConfig,
) -> Result<Vec<u8>, DriveError> {
    let max_attempts = config.download_max_retries.max(1);
    let mut attempt = 1;
    loop {
        match client.download(file_id).await {
            Ok(data) => return Ok(data),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry_delay(config, attempt);
                warn!(file_id, attempt, delay_s = delay.as_secs_f64(), error = %err, "kb_gdrive.download_retry");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn fingerprint_of(files: &[(DriveItem, String, String)]) -> String {
    let mut parts: Vec<String> =
        files.iter().map(|(item, _, _)| format!("{}:{}:{}", item.id, item.modified_time, item.size)).collect();
    parts.sort();
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

fn fingerprint_key(folder_id: &str) -> String {
    format!("ai_coach:gdrive:folder:{folder_id}:fingerprint")
}

fn summary_key(folder_id: &str) -> String {
    format!("ai_coach:gdrive:folder:{folder_id}:summary")
}

pub struct GDriveLoader<E: Engine> {
    client: Arc<dyn DriveClient>,
    kb: Arc<dyn DatasetUpdater>,
    projection: Arc<ProjectionService<E>>,
    locks: RedisLock,
    redis: ConnectionManager,
    config: GDriveConfig,
    folder_id: String,
    dataset_name: String,
    system_user: UserContext,
}

impl<E: Engine> GDriveLoader<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn DriveClient>,
        kb: Arc<dyn DatasetUpdater>,
        projection: Arc<ProjectionService<E>>,
        locks: RedisLock,
        redis: ConnectionManager,
        config: GDriveConfig,
        folder_id: String,
        dataset_name: String,
        system_user: UserContext,
    ) -> Self {
        Self { client, kb, projection, locks, redis, config, folder_id, dataset_name, system_user }
    }

    async fn store_summary(&self, summary: &LoadSummary) {
        let Ok(payload) = serde_json::to_string(summary) else { return };
        let key = summary_key(&self.folder_id);
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = if self.config.summary_ttl_days > 0 {
            let ttl_s = self.config.summary_ttl_days * 24 * 60 * 60;
            conn.set_ex(&key, payload, ttl_s).await
        } else {
            conn.set(&key, payload).await
        };
        if let Err(err) = result {
            debug!(detail = %err, "kb_gdrive.summary_store_failed");
        }
    }

    async fn cached_fingerprint(&self) -> Option<String> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(fingerprint_key(&self.folder_id)).await.unwrap_or(None);
        raw
    }

    async fn store_fingerprint(&self, fingerprint: &str) {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = conn.set(fingerprint_key(&self.folder_id), fingerprint).await;
        if let Err(err) = result {
            debug!(detail = %err, "kb_gdrive.fingerprint_set_failed");
        }
    }

    /// Runs one scan-and-ingest pass. Returns the terminal summary; errors
    /// from individual files are counted rather than propagated, matching
    /// the original's best-effort-continue loop. Only a failure to acquire
    /// the cluster-wide lock, or to scan the tree at all, short-circuits.
    pub async fn load(&self, force_ingest: bool) -> anyhow::Result<LoadSummary> {
        let guard = match self.locks.try_acquire(LOCK_KEY, LOCK_TTL).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("kb_gdrive.skip reason=lock_held");
                return Ok(LoadSummary {
                    status: LoadStatus::Skipped,
                    reason: Some("lock_held".to_string()),
                    ..LoadSummary::starting(&self.dataset_name, &alias_for(&self.dataset_name), &self.folder_id)
                });
            }
            Err(err) => return Err(err.into()),
        };

        let dataset_alias = alias_for(&self.dataset_name);
        let mut summary = LoadSummary::starting(&self.dataset_name, &dataset_alias, &self.folder_id);
        self.store_summary(&summary).await;

        let result = self.run_pass(force_ingest, &dataset_alias, &mut summary).await;
        let _ = guard.release().await;
        result?;
        Ok(summary)
    }

    async fn run_pass(
        &self,
        force_ingest: bool,
        dataset_alias: &str,
        summary: &mut LoadSummary,
    ) -> anyhow::Result<()> {
        let files = match scan_tree(self.client.as_ref(), &self.folder_id).await {
            Ok(files) => files,
            Err(err) => {
                summary.status = LoadStatus::Error;
                summary.reason = Some(err.to_string());
                self.store_summary(summary).await;
                return Err(err.into());
            }
        };

        let total_files = files.len();
        let progress_every = (total_files / 20).max(1);
        summary.files_total = total_files;
        self.store_summary(summary).await;
        info!(folder_id = %self.folder_id, dataset = %self.dataset_name, files = total_files, "kb_gdrive.scan start");

        let fingerprint = fingerprint_of(&files);
        summary.fingerprint = Some(fingerprint.clone());
        self.store_summary(summary).await;

        if !force_ingest {
            if let Some(cached) = self.cached_fingerprint().await {
                if cached == fingerprint {
                    info!(dataset = %dataset_alias, "kb_gdrive.skip reason=fingerprint_match");
                    summary.status = LoadStatus::Skipped;
                    summary.reason = Some("fingerprint_match".to_string());
                    self.store_summary(summary).await;
                    return Ok(());
                }
            }
        }

        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut errors = 0usize;

        for (index, (item, kb_path, kb_folder_path)) in files.iter().enumerate() {
            let index = index + 1;
            let ext = extension_of(&item.name);

            let outcome = self.process_one(item, kb_path, kb_folder_path, &ext, dataset_alias, force_ingest).await;
            match outcome {
                FileOutcome::Processed => processed += 1,
                FileOutcome::Skipped => skipped += 1,
                FileOutcome::Errored => errors += 1,
            }

            let should_log = total_files > 0 && (index == 1 || index % progress_every == 0 || index == total_files);
            if should_log {
                info!(
                    dataset = %dataset_alias, index, total_files, processed, skipped, errors, current = %kb_path,
                    "kb_gdrive.progress"
                );
                summary.processed = processed;
                summary.skipped = skipped;
                summary.errors = errors;
                summary.current = Some(kb_path.clone());
                self.store_summary(summary).await;
            }
        }

        info!(dataset = %self.dataset_name, total_files, processed, skipped, errors, "kb_gdrive.summary");
        summary.processed = processed;
        summary.skipped = skipped;
        summary.errors = errors;
        summary.current = None;
        summary.status = if errors == 0 { LoadStatus::Done } else { LoadStatus::Partial };
        self.store_summary(summary).await;

        if processed > 0 || force_ingest {
            if let Err(err) = self.projection.project(dataset_alias, &self.system_user, force_ingest).await {
                debug!(dataset = %dataset_alias, detail = %err, "kb_gdrive.projection_skip");
            } else {
                let _ = self.projection.wait(dataset_alias, &self.system_user, PROJECTION_WAIT).await;
            }
        }

        if errors == 0 {
            self.store_fingerprint(&fingerprint).await;
        } else {
            warn!(dataset = %self.dataset_name, errors, "kb_gdrive.fingerprint_skipped reason=ingest_failed");
        }

        Ok(())
    }

    async fn process_one(
        &self,
        item: &DriveItem,
        kb_path: &str,
        kb_folder_path: &str,
        ext: &str,
        dataset_alias: &str,
        force_ingest: bool,
    ) -> FileOutcome {
        if !parsers::is_supported_extension(ext) {
            debug!(dataset = %dataset_alias, file = %kb_path, "kb_gdrive.file_decision decision=skip reason=unsupported_extension");
            return FileOutcome::Skipped;
        }
        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;
        if item.size > max_bytes {
            debug!(dataset = %dataset_alias, file = %kb_path, size = item.size, "kb_gdrive.file_decision decision=skip reason=file_too_large");
            return FileOutcome::Skipped;
        }
        if item.id.trim().is_empty() {
            warn!(dataset = %dataset_alias, file = %kb_path, "kb_gdrive.file_decision decision=skip reason=missing_file_id");
            return FileOutcome::Skipped;
        }

        let data = match download_with_retry(self.client.as_ref(), &item.id, &self.config).await {
            Ok(data) => data,
            Err(err) => {
                warn!(dataset = %dataset_alias, file = %kb_path, error = %err, "kb_gdrive.file_failed");
                return FileOutcome::Errored;
            }
        };

        let text = match parsers::parse_by_extension(ext, &data) {
            Ok(text) => text,
            Err(err) => {
                warn!(dataset = %dataset_alias, file = %kb_path, error = %err, "kb_gdrive.file_failed");
                return FileOutcome::Errored;
            }
        };
        let text = sanitize_text(&text);
        let normalized = normalize_text(&text);
        if normalized.trim().is_empty() {
            info!(dataset = %dataset_alias, file_id = %item.id, name = %item.name, "kb_gdrive.empty_document");
            return FileOutcome::Skipped;
        }

        let metadata = serde_json::json!({
            "dataset": dataset_alias,
            "source": "gdrive",
            "file_id": item.id,
            "name": item.name,
            "path": kb_path,
            "folder_path": kb_folder_path,
            "mime_type": item.mime_type,
            "size": item.size,
            "modified_ts": item.modified_time,
        });
        let node_set = vec![format!("gdrive:{}", item.id)];

        let result = self
            .kb
            .update_dataset(&normalized, &self.dataset_name, &self.system_user, Some(&node_set), Some(metadata))
            .await;
        match result {
            Ok((resolved, created)) => {
                if !created && !force_ingest {
                    debug!(dataset = %dataset_alias, file = %kb_path, "kb_gdrive.file_decision decision=skip reason=duplicate_digest");
                    return FileOutcome::Skipped;
                }
                debug!(dataset_alias = %dataset_alias, resolved, file_id = %item.id, "kb_gdrive.ingested");
                FileOutcome::Processed
            }
            Err(err) => {
                warn!(dataset = %dataset_alias, file = %kb_path, error = %err, "kb_gdrive.file_failed");
                FileOutcome::Errored
            }
        }
    }
}

enum FileOutcome {
    Processed,
    Skipped,
    Errored,
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::mock::MockDriveClient;

    fn item(id: &str, name: &str, size: u64, is_folder: bool) -> DriveItem {
        DriveItem {
            id: id.to_string(),
            name: name.to_string(),
            size,
            mime_type: if is_folder { "application/vnd.google-apps.folder".to_string() } else { "text/plain".to_string() },
            modified_time: "2026-01-01T00:00:00Z".to_string(),
            is_folder,
        }
    }

    #[tokio::test]
    async fn scan_tree_walks_nested_folders_and_skips_cycles() {
        let client = MockDriveClient::new();
        client.add_folder("root", vec![item("sub", "docs", 0, true), item("f1", "a.txt", 10, false)]);
        client.add_folder("sub", vec![item("f2", "b.txt", 20, false), item("root", "loop", 0, true)]);

        let files = scan_tree(&client, "root").await.unwrap();
        let paths: HashSet<String> = files.iter().map(|(_, path, _)| path.clone()).collect();
        assert_eq!(paths, HashSet::from(["a.txt".to_string(), "docs/b.txt".to_string()]));
    }

    #[tokio::test]
    async fn download_with_retry_recovers_from_transient_failures() {
        let client = MockDriveClient::new();
        client.add_file("f1", b"hello".to_vec());
        client.fail_downloads_then_succeed("f1", 2);

        let config = GDriveConfig { download_initial_delay_s: 0.0, download_max_delay_s: 0.0, ..GDriveConfig::default() };
        let data = download_with_retry(&client, "f1", &config).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn download_with_retry_gives_up_after_max_attempts() {
        let client = MockDriveClient::new();
        client.add_file("f1", b"hello".to_vec());
        client.fail_downloads_then_succeed("f1", 10);

        let config = GDriveConfig {
            download_max_retries: 2,
            download_initial_delay_s: 0.0,
            download_max_delay_s: 0.0,
            ..GDriveConfig::default()
        };
        let err = download_with_retry(&client, "f1", &config).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = item("1", "a.txt", 10, false);
        let b = item("2", "b.txt", 20, false);
        let forward = vec![(a.clone(), "a.txt".to_string(), String::new()), (b.clone(), "b.txt".to_string(), String::new())];
        let backward = vec![(b, "b.txt".to_string(), String::new()), (a, "a.txt".to_string(), String::new())];
        assert_eq!(fingerprint_of(&forward), fingerprint_of(&backward));
    }

    #[test]
    fn extension_of_lowercases_and_includes_dot() {
        assert_eq!(extension_of("Report.PDF"), ".pdf");
        assert_eq!(extension_of("noext"), "");
    }
}
