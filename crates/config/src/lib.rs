use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the content-addressed text store (§4.B).
    pub cognee_storage_path: String,
    /// Alias of the shared, cross-profile dataset (§2, component A/C).
    pub cognee_global_dataset: String,
    /// TTL in days for HashStore entries and per-folder backups.
    pub backup_retention_days: u64,
    /// Gates `ProjectionService::ensure_projected`'s heal-and-retry loop and
    /// `project`'s full-rebuild fallback (§4.E, §9 Open Questions).
    pub cognee_enable_aggressive_rebuild: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cognee_storage_path: "./data/cognee_storage".to_string(),
            cognee_global_dataset: "kb_global".to_string(),
            backup_retention_days: 30,
            cognee_enable_aggressive_rebuild: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshApiConfig {
    pub user: String,
    pub password: String,
}

impl Default for RefreshApiConfig {
    fn default() -> Self {
        Self {
            user: "ai_coach".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalAuthConfig {
    pub key_id: String,
    pub api_key: String,
}

impl Default for InternalAuthConfig {
    fn default() -> Self {
        Self {
            key_id: "internal".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// TTL (seconds) for ask-AI request dedup keys (§6.5 `ai:ask:*`).
    pub ai_qa_dedup_ttl_s: u64,
    /// TTL (seconds) for plan request dedup keys (§6.5 `ai:plan:*`).
    pub ai_plan_dedup_ttl_s: u64,
    pub ai_qa_max_retries: u32,
    pub ai_qa_retry_backoff_s: f64,
    /// Soft deadline for an upstream agent call before treated as a timeout.
    pub ai_coach_timeout_s: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            ai_qa_dedup_ttl_s: 24 * 60 * 60,
            ai_plan_dedup_ttl_s: 24 * 60 * 60,
            ai_qa_max_retries: 3,
            ai_qa_retry_backoff_s: 2.0,
            ai_coach_timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatProjectionConfig {
    /// Debounce window, in minutes, before a dirty chat dataset is cognified.
    pub debounce_minutes: u64,
}

impl Default for ChatProjectionConfig {
    fn default() -> Self {
        Self { debounce_minutes: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GDriveConfig {
    pub max_file_size_mb: u64,
    pub download_max_retries: u32,
    pub download_initial_delay_s: f64,
    pub download_backoff_factor: f64,
    pub download_max_delay_s: f64,
    /// Retention for the `ai_coach:gdrive:folder:<id>:summary` status key.
    /// Zero means store it without a TTL.
    pub summary_ttl_days: u64,
}

impl Default for GDriveConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 25,
            download_max_retries: 5,
            download_initial_delay_s: 1.0,
            download_backoff_factor: 2.0,
            download_max_delay_s: 30.0,
            summary_ttl_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileApiConfig {
    /// Base URL of the profile service's credit endpoint (§4.J).
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_s: u64,
}

impl Default for ProfileApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: String::new(),
            request_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotCallbackConfig {
    /// Base URL of the bot service's internal callback API (§6.1).
    pub bot_internal_url: String,
    pub request_timeout_s: u64,
    /// Max acceptable clock skew, in seconds, for the HMAC timestamp header.
    pub max_clock_skew_s: i64,
}

impl Default for BotCallbackConfig {
    fn default() -> Self {
        Self {
            bot_internal_url: "http://localhost:8080".to_string(),
            request_timeout_s: 10,
            max_clock_skew_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub redis: RedisConfig,
    pub refresh_api: RefreshApiConfig,
    pub internal_auth: InternalAuthConfig,
    pub task: TaskConfig,
    pub chat_projection: ChatProjectionConfig,
    pub gdrive: GDriveConfig,
    pub bot_callback: BotCallbackConfig,
    pub profile_api: ProfileApiConfig,
}

/// Overlay a single environment variable onto `target` when set and non-empty.
fn overlay_str(target: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn overlay_parsed<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

impl AppConfig {
    /// Load from a TOML file if present, then apply environment overrides
    /// matching the names in spec §6.6. Missing file is not an error — the
    /// defaults above apply, matching the teacher's `load_from` semantics.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        overlay_str(&mut self.storage.cognee_storage_path, "COGNEE_STORAGE_PATH");
        overlay_str(&mut self.storage.cognee_global_dataset, "COGNEE_GLOBAL_DATASET");
        overlay_parsed(&mut self.storage.backup_retention_days, "BACKUP_RETENTION_DAYS");
        overlay_parsed(&mut self.storage.cognee_enable_aggressive_rebuild, "COGNEE_ENABLE_AGGRESSIVE_REBUILD");

        overlay_str(&mut self.redis.url, "REDIS_URL");

        overlay_str(&mut self.refresh_api.user, "AI_COACH_REFRESH_USER");
        overlay_str(&mut self.refresh_api.password, "AI_COACH_REFRESH_PASSWORD");

        overlay_str(&mut self.internal_auth.key_id, "INTERNAL_KEY_ID");
        overlay_str(&mut self.internal_auth.api_key, "INTERNAL_API_KEY");

        overlay_parsed(&mut self.task.ai_qa_dedup_ttl_s, "AI_QA_DEDUP_TTL");
        overlay_parsed(&mut self.task.ai_plan_dedup_ttl_s, "AI_PLAN_DEDUP_TTL");
        overlay_parsed(&mut self.task.ai_qa_max_retries, "AI_QA_MAX_RETRIES");
        overlay_parsed(&mut self.task.ai_qa_retry_backoff_s, "AI_QA_RETRY_BACKOFF_S");
        overlay_parsed(&mut self.task.ai_coach_timeout_s, "AI_COACH_TIMEOUT");

        overlay_parsed(
            &mut self.chat_projection.debounce_minutes,
            "KB_CHAT_PROJECT_DEBOUNCE_MIN",
        );

        overlay_parsed(&mut self.gdrive.max_file_size_mb, "MAX_FILE_SIZE_MB");
        overlay_parsed(&mut self.gdrive.download_max_retries, "GDRIVE_DOWNLOAD_MAX_RETRIES");
        overlay_parsed(
            &mut self.gdrive.download_initial_delay_s,
            "GDRIVE_DOWNLOAD_INITIAL_DELAY_S",
        );
        overlay_parsed(
            &mut self.gdrive.download_backoff_factor,
            "GDRIVE_DOWNLOAD_BACKOFF_FACTOR",
        );
        overlay_parsed(&mut self.gdrive.download_max_delay_s, "GDRIVE_DOWNLOAD_MAX_DELAY_S");
        overlay_parsed(&mut self.gdrive.summary_ttl_days, "COGNEE_GDRIVE_SUMMARY_TTL_DAYS");

        overlay_str(&mut self.bot_callback.bot_internal_url, "BOT_INTERNAL_URL");

        overlay_str(&mut self.profile_api.base_url, "PROFILE_API_BASE_URL");
        overlay_str(&mut self.profile_api.api_key, "PROFILE_API_KEY");
        overlay_parsed(&mut self.profile_api.request_timeout_s, "PROFILE_API_TIMEOUT_S");
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_non_empty() {
        let config = AppConfig::default();
        assert_eq!(config.storage.cognee_global_dataset, "kb_global");
        assert!(config.task.ai_qa_max_retries > 0);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.storage.cognee_storage_path = "/tmp/kb".to_string();
        config.save_to(&path).unwrap();

        // SAFETY: test process has exclusive control over these env vars.
        unsafe {
            std::env::remove_var("COGNEE_STORAGE_PATH");
        }
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.storage.cognee_storage_path, "/tmp/kb");
    }

    #[test]
    fn env_overrides_take_precedence() {
        // SAFETY: test process has exclusive control over these env vars.
        unsafe {
            std::env::set_var("COGNEE_GLOBAL_DATASET", "kb_global_test");
        }
        let config = AppConfig::from_env();
        assert_eq!(config.storage.cognee_global_dataset, "kb_global_test");
        unsafe {
            std::env::remove_var("COGNEE_GLOBAL_DATASET");
        }
    }
}
