//! On-disk content-addressed text blobs keyed by SHA-256 digest (spec §4.B).
//!
//! Write protocol mirrors the teacher's event log: write to a `.tmp`
//! sibling, fsync, atomic rename, clean the temp file up on any failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use md5::{Digest as Md5Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct ContentStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cache: RwLock::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_sha(&self, sha: &str) -> Option<PathBuf> {
        if !is_sha256_hex(sha) {
            warn!(sha, "storage_path_invalid_digest");
            return None;
        }
        Some(self.root.join(format!("text_{sha}.txt")))
    }

    /// Any absolute path outside the configured root is flattened to
    /// `<root>/<basename>`, for adapting to engines that assume a
    /// different root layout.
    pub fn remap(&self, path: &Path) -> PathBuf {
        if path.starts_with(&self.root) {
            return path.to_path_buf();
        }
        match path.file_name() {
            Some(name) => self.root.join(name),
            None => self.root.join(path),
        }
    }

    pub async fn read(&self, sha: &str) -> Option<String> {
        if let Some(cached) = self.cache.read().unwrap().get(sha).cloned() {
            return Some(cached);
        }
        let path = self.path_for_sha(sha)?;
        let text = fs::read_to_string(&path).await.ok()?;
        self.cache.write().unwrap().insert(sha.to_string(), text.clone());
        Some(text)
    }

    /// Write-if-absent. Returns `(path, created)`; `created=false` means
    /// either the blob already existed or the write failed (failures are
    /// swallowed per spec §4.B, logged at warn level).
    pub async fn ensure(&self, sha: &str, text: &str) -> (Option<PathBuf>, bool) {
        let Some(path) = self.path_for_sha(sha) else {
            return (None, false);
        };

        if fs::metadata(&path).await.is_ok() {
            self.ensure_md5_mirror(&path, text).await;
            return (Some(path), false);
        }

        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                warn!(sha, error = %err, "knowledge_storage_mkdir_failed");
                return (None, false);
            }
        }

        let tmp_path = path.with_extension("txt.tmp");
        match write_atomic(&tmp_path, &path, text).await {
            Ok(()) => {
                self.cache.write().unwrap().insert(sha.to_string(), text.to_string());
                self.ensure_md5_mirror(&path, text).await;
                debug!(sha, "kb_storage ensure created=true");
                (Some(path), true)
            }
            Err(err) => {
                warn!(sha, error = %err, "knowledge_storage_write_failed");
                let _ = fs::remove_file(&tmp_path).await;
                (None, false)
            }
        }
    }

    /// Legacy compatibility mirror: a second copy of the blob named by its
    /// MD5 digest, so callers still probing the pre-SHA256 naming scheme
    /// keep working (spec §6.4).
    async fn ensure_md5_mirror(&self, sha_path: &Path, text: &str) {
        let mut hasher = Md5::new();
        hasher.update(text.as_bytes());
        let md5_hex = hex::encode(hasher.finalize());
        let Some(file_name) = sha_path.file_name() else { return };
        let md5_path = sha_path.with_file_name(format!("text_{md5_hex}.txt"));
        if fs::metadata(&md5_path).await.is_ok() {
            return;
        }
        #[cfg(unix)]
        {
            if tokio::fs::symlink(file_name, &md5_path).await.is_ok() {
                debug!(md5 = %md5_hex, "md5_mirror_link_created");
                return;
            }
        }
        if let Err(err) = fs::write(&md5_path, text).await {
            debug!(md5 = %md5_hex, error = %err, "md5_mirror_skip");
        } else {
            debug!(md5 = %md5_hex, "md5_mirror_file_created");
        }
    }

    pub fn digest_from_filename(filename: &str) -> Option<String> {
        filename.strip_prefix("text_").and_then(|rest| rest.strip_suffix(".txt")).map(str::to_string)
    }
}

async fn write_atomic(tmp_path: &Path, final_path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp_path).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp_path, final_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_writes_once_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let sha = coachkb_sha256_for_test("hello");

        let (path1, created1) = store.ensure(&sha, "hello").await;
        assert!(created1);
        let (path2, created2) = store.ensure(&sha, "hello").await;
        assert!(!created2);
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn read_returns_written_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let sha = coachkb_sha256_for_test("round trip me");
        store.ensure(&sha, "round trip me").await;
        let read_back = store.read(&sha).await;
        assert_eq!(read_back.as_deref(), Some("round trip me"));
    }

    #[test]
    fn remap_flattens_foreign_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let foreign = Path::new("/some/other/root/text_abc.txt");
        assert_eq!(store.remap(foreign), dir.path().join("text_abc.txt"));
    }

    #[test]
    fn digest_from_filename_parses_expected_shape() {
        assert_eq!(ContentStore::digest_from_filename("text_deadbeef.txt"), Some("deadbeef".to_string()));
        assert_eq!(ContentStore::digest_from_filename("other.txt"), None);
    }

    fn coachkb_sha256_for_test(text: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }
}
