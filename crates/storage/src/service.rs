//! Keeps the HashStore, ContentStore, and engine dataset in agreement (spec §4.D).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use coachkb_engine::{Engine, EngineRow, UserContext};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::content_store::ContentStore;
use crate::dataset_registry::{alias_for, DatasetRegistry};
use crate::hash_store::HashStore;
use crate::text::normalize_text;

/// Capability the knowledge base facade implements so `StorageService` can
/// restore documents without depending on the facade crate directly (spec
/// §9 Design Notes: resolve cycles via capability traits, not back-pointers).
#[async_trait]
pub trait DatasetUpdater: Send + Sync {
    async fn update_dataset(
        &self,
        text: &str,
        alias: &str,
        user: &UserContext,
        node_set: Option<&[String]>,
        metadata: Option<JsonValue>,
    ) -> anyhow::Result<(String, bool)>;
}

#[derive(Debug, Default, Clone)]
pub struct RebuildResult {
    pub reinserted: usize,
    pub healed_documents: usize,
    pub rehydrated: usize,
    pub last_dataset: Option<String>,
    pub healed: bool,
    pub reason: Option<String>,
}

impl RebuildResult {
    fn ok() -> Self {
        Self { healed: true, reason: Some("ok".to_string()), ..Default::default() }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DiskRebuildSummary {
    pub created: usize,
    pub linked: usize,
    pub mismatches: usize,
    pub unreadable: usize,
    pub empty: usize,
}

#[derive(Debug, Clone)]
pub struct StorageDiagnostics {
    pub root: String,
    pub root_exists: bool,
    pub root_writable: bool,
    pub entries_count: usize,
}

pub struct StorageService<E: Engine> {
    content: ContentStore,
    hashes: HashStore,
    registry: Arc<DatasetRegistry<E>>,
    knowledge_base: std::sync::RwLock<Option<Arc<dyn DatasetUpdater>>>,
}

impl<E: Engine> StorageService<E> {
    pub fn new(content: ContentStore, hashes: HashStore, registry: Arc<DatasetRegistry<E>>) -> Self {
        Self { content, hashes, registry, knowledge_base: std::sync::RwLock::new(None) }
    }

    pub fn attach_knowledge_base(&self, kb: Arc<dyn DatasetUpdater>) {
        *self.knowledge_base.write().unwrap() = Some(kb);
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    pub fn hash_store(&self) -> &HashStore {
        &self.hashes
    }

    pub fn compute_digest(&self, normalized_text: &str) -> String {
        compute_digest(normalized_text)
    }

    /// Stamps `dataset`/`digest_sha`, defaults `kind` to `"document"`.
    pub fn augment_metadata(&self, extra: Option<&JsonValue>, alias: &str, digest_sha: &str) -> JsonValue {
        augment_metadata(extra, alias, digest_sha)
    }

    /// For each entry, ensures its blob exists and the HashStore has a
    /// record; returns `(missing, healed)` counts.
    pub async fn heal(&self, alias: &str, entries: &[EngineRow]) -> (usize, usize) {
        let canonical = alias_for(alias);
        let mut missing = 0;
        let mut healed = 0;
        for entry in entries {
            let normalized = normalize_text(&entry.text);
            if normalized.is_empty() {
                warn!(dataset = %canonical, "knowledge_dataset_heal_unrecoverable reason=empty_content");
                continue;
            }
            let digest_sha = self.compute_digest(&normalized);
            let Some(path) = self.content.path_for_sha(&digest_sha) else { continue };
            if fs::metadata(&path).await.is_err() {
                missing += 1;
            }
            let (_, created) = self.content.ensure(&digest_sha, &normalized).await;
            if created {
                healed += 1;
            }
            let metadata = self.augment_metadata(Some(&entry.metadata), &canonical, &digest_sha);
            self.hashes.add(&canonical, &digest_sha, Some(&metadata)).await;
        }
        if missing > 0 || healed > 0 {
            debug!(dataset = %canonical, missing, healed, "knowledge_dataset_storage_heal");
        }
        (missing, healed)
    }

    /// Scans the content root for `text_<sha>.txt`, validates filename SHA
    /// matches recomputed content SHA, re-registers into HashStore. Files
    /// whose filename SHA doesn't match content are skipped with a warning;
    /// legacy MD5-named files are ignored.
    pub async fn rebuild_from_disk(&self, alias: &str) -> DiskRebuildSummary {
        let canonical = alias_for(alias);
        let mut summary = DiskRebuildSummary::default();
        let root = self.content.root();
        let Ok(mut dir) = fs::read_dir(root).await else { return summary };

        let sha_pattern = Regex::new(r"^text_([0-9a-f]{64})\.txt$").unwrap();
        let md5_pattern = Regex::new(r"^text_([0-9a-f]{32})\.txt$").unwrap();

        while let Ok(Some(entry)) = dir.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };

            let Some(captures) = sha_pattern.captures(name) else {
                if md5_pattern.is_match(name) {
                    debug!(path = name, "rebuild_disk_md5_ignored");
                }
                continue;
            };
            let digest_from_name = captures[1].to_string();

            let contents = match fs::read_to_string(entry.path()).await {
                Ok(contents) => contents,
                Err(_) => {
                    summary.unreadable += 1;
                    continue;
                }
            };
            let normalized = normalize_text(&contents);
            if normalized.is_empty() {
                summary.empty += 1;
                continue;
            }
            let digest_from_content = self.compute_digest(&normalized);
            if digest_from_content != digest_from_name {
                warn!(
                    dataset = %canonical,
                    path_sha = %digest_from_name,
                    content_sha = %digest_from_content,
                    "knowledge_rebuild_digest_mismatch"
                );
                summary.mismatches += 1;
                continue;
            }

            let metadata = self.augment_metadata(None, &canonical, &digest_from_content);
            let already = self.hashes.contains(&canonical, &digest_from_content).await;
            self.hashes.add(&canonical, &digest_from_content, Some(&metadata)).await;
            summary.linked += 1;
            if !already {
                summary.created += 1;
            }
        }

        if summary.created > 0 || summary.linked > 0 || summary.mismatches > 0 || summary.unreadable > 0 || summary.empty > 0
        {
            info!(
                dataset = %canonical,
                created = summary.created,
                linked = summary.linked,
                mismatches = summary.mismatches,
                unreadable = summary.unreadable,
                empty = summary.empty,
                "rebuild:summary"
            );
        }
        summary
    }

    /// Recovers text for each known digest (blob, legacy MD5 mirror, or
    /// metadata's own `text` field), re-inserting via the attached
    /// `DatasetUpdater`. Skips entries whose `kind` is `"message"`; removes
    /// stale HashStore entries whose text cannot be recovered at all.
    pub async fn reingest_from_hashstore(
        &self,
        alias: &str,
        user: &UserContext,
        digests: &[(String, Option<JsonValue>)],
    ) -> RebuildResult {
        let canonical = alias_for(alias);
        let mut result = RebuildResult::ok();
        if digests.is_empty() {
            return result;
        }

        let kb = match self.knowledge_base.read().unwrap().clone() {
            Some(kb) => kb,
            None => {
                result.healed = false;
                result.reason = Some("knowledge_base_unavailable".to_string());
                return result;
            }
        };

        for (digest_sha, metadata) in digests {
            if digest_sha.len() != 64 {
                warn!(digest = %digest_sha, "hashstore_legacy_digest_skipped");
                continue;
            }

            let mut normalized = self.content.read(digest_sha).await.map(|t| normalize_text(&t));
            if normalized.as_deref().is_none_or(str::is_empty) {
                if let Some(text) = metadata.as_ref().and_then(|m| m.get("text")).and_then(|v| v.as_str()) {
                    let candidate = normalize_text(text);
                    if !candidate.is_empty() {
                        self.content.ensure(digest_sha, &candidate).await;
                        result.healed_documents += 1;
                        normalized = Some(candidate);
                    }
                } else if metadata.is_none() {
                    if self.hashes.contains(&canonical, digest_sha).await {
                        self.hashes.remove(&canonical, digest_sha).await;
                        warn!(dataset = %canonical, digest = %digest_sha, "knowledge_reingest_stale_md5_removed");
                    }
                    continue;
                }
            }

            let Some(normalized) = normalized.filter(|t| !t.is_empty()) else {
                warn!(dataset = %canonical, digest = %digest_sha, "knowledge_reingest_unrecoverable");
                continue;
            };

            let kind = metadata.as_ref().and_then(|m| m.get("kind")).and_then(|v| v.as_str());
            if kind == Some("message") {
                continue;
            }

            match kb.update_dataset(&normalized, &canonical, user, None, metadata.clone()).await {
                Ok((dataset_name, created)) => {
                    if created {
                        result.reinserted += 1;
                        result.last_dataset = Some(dataset_name);
                    }
                }
                Err(err) => {
                    result.healed = false;
                    result.reason = Some(err.to_string());
                    break;
                }
            }
        }

        if result.reinserted > 0 {
            result.rehydrated = result.reinserted;
        }
        if result.reinserted > 0 || result.healed_documents > 0 || result.rehydrated > 0 {
            info!(
                dataset = %canonical,
                reinserted = result.reinserted,
                healed = result.healed_documents,
                rehydrated = result.rehydrated,
                "reingest:summary"
            );
        }
        if let Some(dataset_name) = &result.last_dataset {
            if let Ok(id) = dataset_name.parse() {
                self.registry.register(&canonical, coachkb_engine::DatasetId(id));
            }
        }
        result
    }

    /// One-time migration pass: any HashStore entry keyed by a bare 32-hex
    /// MD5 digest is converted to its SHA or removed.
    pub async fn sanitize_hash_store(&self) -> crate::hash_store::SanitizeReport {
        let mut total = crate::hash_store::SanitizeReport::default();
        for alias in self.hashes.list_all_datasets().await {
            let report = self.hashes.sanitize(&alias).await;
            total.converted += report.converted;
            total.removed += report.removed;
        }
        if total.converted > 0 || total.removed > 0 {
            info!(converted = total.converted, removed = total.removed, "kb_hashstore_sanitation_completed");
        } else {
            info!("kb_hashstore_sanitation_skipped reason=no_md5_entries_found");
        }
        total
    }

    pub async fn diagnostics(&self) -> StorageDiagnostics {
        let root = self.content.root();
        let root_exists = fs::metadata(root).await.is_ok();
        let root_writable = is_writable(root).await;
        let mut entries_count = 0usize;
        if let Ok(mut dir) = fs::read_dir(root).await {
            while let Ok(Some(_)) = dir.next_entry().await {
                entries_count += 1;
            }
        }
        StorageDiagnostics { root: root.display().to_string(), root_exists, root_writable, entries_count }
    }
}

fn compute_digest(normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stamps `dataset`/`digest_sha`, defaults `kind` to `"document"`.
fn augment_metadata(extra: Option<&JsonValue>, alias: &str, digest_sha: &str) -> JsonValue {
    let mut payload = match extra.and_then(|v| v.as_object()) {
        Some(obj) => obj.clone(),
        None => Map::new(),
    };
    let dataset_value = payload.get("dataset").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_default();
    let dataset_value = if alias.trim().is_empty() { dataset_value } else { alias.to_string() };
    if dataset_value.trim().is_empty() {
        payload.remove("dataset");
    } else {
        payload.insert("dataset".to_string(), JsonValue::String(dataset_value));
    }
    payload.insert("digest_sha".to_string(), JsonValue::String(digest_sha.to_string()));
    payload.entry("kind").or_insert_with(|| JsonValue::String("document".to_string()));
    JsonValue::Object(payload)
}

async fn is_writable(root: &Path) -> bool {
    let probe = root.join(".write_probe");
    match fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = fs::remove_file(&probe).await;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_digest_matches_hash_store_digest() {
        assert_eq!(compute_digest("hello"), HashStore::digest_for_text("hello"));
    }

    #[test]
    fn augment_metadata_sets_dataset_and_kind_defaults() {
        let digest = "a".repeat(64);
        let merged = augment_metadata(None, "kb_profile_1", &digest);
        assert_eq!(merged["dataset"], "kb_profile_1");
        assert_eq!(merged["digest_sha"], digest);
        assert_eq!(merged["kind"], "document");
    }

    #[test]
    fn augment_metadata_preserves_explicit_kind() {
        let digest = "b".repeat(64);
        let extra = serde_json::json!({ "kind": "message" });
        let merged = augment_metadata(Some(&extra), "kb_global", &digest);
        assert_eq!(merged["kind"], "message");
    }
}
