//! Per-dataset set of content digests plus a parallel metadata hash (spec §4.A).
//!
//! Backed by Redis db 2 in the original; callers open the [`redis::Client`]
//! against that database (e.g. `redis://host:6379/2`) before building the
//! [`redis::aio::ConnectionManager`] passed in here.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::error;

fn set_key(dataset: &str) -> String {
    format!("cognee_hashes:{dataset}")
}

fn meta_key(dataset: &str) -> String {
    format!("cognee_hash_meta:{dataset}")
}

#[derive(Clone)]
pub struct HashStore {
    conn: ConnectionManager,
    retention: Duration,
}

impl HashStore {
    pub fn new(conn: ConnectionManager, retention: Duration) -> Self {
        Self { conn, retention }
    }

    pub fn digest_for_text(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// O(1) set membership; best-effort, swallowing transport errors and
    /// returning `false` rather than propagating (spec §4.A: "callers must
    /// tolerate a false `contains=false`").
    pub async fn contains(&self, dataset: &str, sha: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.sismember::<_, _, bool>(set_key(dataset), sha).await {
            Ok(present) => present,
            Err(err) => {
                error!(dataset, sha, error = %err, "HashStore.contains error");
                false
            }
        }
    }

    pub async fn add(&self, dataset: &str, sha: &str, metadata: Option<&JsonValue>) {
        let mut conn = self.conn.clone();
        let key = set_key(dataset);
        if let Err(err) = conn.sadd::<_, _, ()>(&key, sha).await {
            error!(dataset, sha, error = %err, "HashStore.add error");
            return;
        }
        let ttl_secs = self.retention.as_secs();
        if let Err(err) = conn.expire::<_, ()>(&key, ttl_secs as i64).await {
            error!(dataset, sha, error = %err, "HashStore.add expire error");
        }
        if let Some(meta) = metadata {
            let encoded = meta.to_string();
            if let Err(err) = conn.hset::<_, _, _, ()>(meta_key(dataset), sha, encoded).await {
                error!(dataset, sha, error = %err, "HashStore.add metadata error");
            }
        }
    }

    pub async fn clear(&self, dataset: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.del::<_, ()>(set_key(dataset)).await {
            error!(dataset, error = %err, "HashStore.clear error");
        }
        if let Err(err) = conn.del::<_, ()>(meta_key(dataset)).await {
            error!(dataset, error = %err, "HashStore.clear meta error");
        }
    }

    pub async fn metadata(&self, dataset: &str, sha: &str) -> Option<JsonValue> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.hget(meta_key(dataset), sha).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(dataset, sha, error = %err, "HashStore.metadata error");
                return None;
            }
        };
        let raw = raw?;
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str::<JsonValue>(&raw) {
            Ok(value) if value.is_object() => Some(value),
            Ok(_) => None,
            Err(_) => {
                tracing::warn!(dataset, "HashStore.metadata decode_failed");
                None
            }
        }
    }

    pub async fn metadata_for_text(&self, dataset: &str, text: &str) -> Option<JsonValue> {
        self.metadata(dataset, &Self::digest_for_text(text)).await
    }

    pub async fn list(&self, dataset: &str) -> Vec<String> {
        let mut conn = self.conn.clone();
        conn.smembers(set_key(dataset)).await.unwrap_or_else(|err| {
            error!(dataset, error = %err, "HashStore.list error");
            Vec::new()
        })
    }

    pub async fn count(&self, dataset: &str) -> usize {
        let mut conn = self.conn.clone();
        conn.scard(set_key(dataset)).await.unwrap_or_else(|err| {
            error!(dataset, error = %err, "HashStore.count error");
            0
        })
    }

    /// Not present in the original, which had no index of its own key
    /// space; supplemented here (spec SPEC_FULL §11) via Redis `SCAN` over
    /// the `cognee_hashes:*` pattern, needed by the diagnostics endpoint.
    pub async fn list_all_datasets(&self) -> Vec<String> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut datasets = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("cognee_hashes:*")
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    error!(error = %err, "HashStore.list_all_datasets scan error");
                    break;
                }
            };
            for key in keys {
                if let Some(alias) = key.strip_prefix("cognee_hashes:") {
                    datasets.push(alias.to_string());
                }
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        datasets
    }

    pub async fn remove(&self, dataset: &str, sha: &str) {
        let mut conn = self.conn.clone();
        let _ = conn.srem::<_, _, ()>(set_key(dataset), sha).await;
        let _ = conn.hdel::<_, _, ()>(meta_key(dataset), sha).await;
    }

    /// One-time migration: any set entry keyed by a bare 32-hex MD5 digest
    /// (from the legacy mirror scheme) is recomputed to its SHA-256 from
    /// the metadata's stored `text`, converted in place, or dropped when no
    /// recoverable text is present (spec §4.D `sanitize_hash_store`).
    pub async fn sanitize(&self, dataset: &str) -> SanitizeReport {
        let mut report = SanitizeReport::default();
        for entry in self.list(dataset).await {
            if !is_md5_hex(&entry) {
                continue;
            }
            let meta = self.metadata(dataset, &entry).await;
            let text = meta.as_ref().and_then(|meta| meta.get("text")).and_then(|v| v.as_str());

            match text {
                Some(text) => {
                    let sha = Self::digest_for_text(text);
                    if self.contains(dataset, &sha).await {
                        self.remove(dataset, &entry).await;
                    } else {
                        self.remove(dataset, &entry).await;
                        self.add(dataset, &sha, meta.as_ref()).await;
                    }
                    report.converted += 1;
                }
                None => {
                    self.remove(dataset, &entry).await;
                    report.removed += 1;
                }
            }
        }
        report
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    pub converted: usize,
    pub removed: usize,
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Not part of the Redis-backed store; used by callers to pre-build a
/// metadata/digest index without touching Redis (e.g. tests).
pub fn metadata_digest_sha(metadata: &HashMap<String, JsonValue>) -> Option<String> {
    metadata.get("digest_sha").and_then(|value| value.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_sha256() {
        let a = HashStore::digest_for_text("hello world");
        let b = HashStore::digest_for_text("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn md5_and_sha256_classifiers_agree_with_lengths() {
        assert!(is_md5_hex("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_sha256_hex("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(is_sha256_hex(&HashStore::digest_for_text("x")));
    }
}
