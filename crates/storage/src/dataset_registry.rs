//! Resolves dataset aliases to opaque engine identifiers (spec §4.C).

use std::collections::HashMap;
use std::sync::RwLock;

use coachkb_engine::{DatasetId, Engine, EngineError, EngineRow, UserContext};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("dataset not found: {0}")]
    NotFound(String),
    #[error("engine call failed: {0}")]
    Engine(#[from] EngineError),
}

/// Rewrites legacy alias forms to the canonical `kb_profile_<N>` shape.
/// Two legacy prefixes are recognized: the bare `client_<N>` form named in
/// the spec's glossary, and `kb_client_<N>`, the form the original system
/// itself used internally before this rewrite existed.
pub fn alias_for(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return name.to_string();
    }
    for prefix in ["kb_client_", "client_"] {
        if let Some(suffix) = trimmed.strip_prefix(prefix) {
            if let Ok(client_id) = suffix.parse::<u64>() {
                return format!("kb_profile_{client_id}");
            }
        }
    }
    trimmed.to_string()
}

pub fn dataset_name(profile_id: u64) -> String {
    format!("kb_profile_{profile_id}")
}

pub fn chat_dataset_name(profile_id: u64) -> String {
    format!("kb_chat_{profile_id}")
}

pub fn is_chat_dataset(alias: &str) -> bool {
    alias_for(alias).starts_with("kb_chat_")
}

/// In-process `alias -> identifier` / `identifier -> alias` maps, populated
/// lazily; the external engine remains the persistent source of truth.
pub struct DatasetRegistry<E: Engine> {
    engine: std::sync::Arc<E>,
    ids: RwLock<HashMap<String, DatasetId>>,
    aliases: RwLock<HashMap<DatasetId, String>>,
}

impl<E: Engine> DatasetRegistry<E> {
    pub fn new(engine: std::sync::Arc<E>) -> Self {
        Self { engine, ids: RwLock::new(HashMap::new()), aliases: RwLock::new(HashMap::new()) }
    }

    pub fn alias_for(&self, name: &str) -> String {
        alias_for(name)
    }

    pub fn register(&self, alias: &str, id: DatasetId) {
        let canonical = alias_for(alias);
        self.ids.write().unwrap().insert(canonical.clone(), id);
        self.aliases.write().unwrap().insert(id, canonical);
    }

    pub fn cached_id(&self, alias: &str) -> Option<DatasetId> {
        self.ids.read().unwrap().get(&alias_for(alias)).copied()
    }

    /// Idempotent create: returns the cached id if known, otherwise asks
    /// the engine to create (or fetch) the dataset and caches the result.
    /// Resilient to a "database not created" engine condition by invoking
    /// `setup()` once and retrying.
    pub async fn ensure_exists(&self, alias: &str, user: &UserContext) -> Result<DatasetId, ProbeError> {
        let canonical = alias_for(alias);
        if let Some(id) = self.cached_id(&canonical) {
            return Ok(id);
        }

        match self.engine.get_authorized_dataset_by_name(&canonical, user).await {
            Ok(Some(id)) => {
                self.register(&canonical, id);
                return Ok(id);
            }
            Ok(None) => {}
            Err(EngineError::SetupRequired) => {
                warn!(alias = %canonical, "dataset registry triggering one-time engine setup");
                self.engine.setup().await?;
            }
            Err(other) => return Err(other.into()),
        }

        let id = self.engine.create_authorized_dataset(&canonical, user).await?;
        self.register(&canonical, id);
        Ok(id)
    }

    pub async fn get_dataset_id(&self, alias: &str, user: &UserContext) -> Result<Option<DatasetId>, ProbeError> {
        let canonical = alias_for(alias);
        if let Some(id) = self.cached_id(&canonical) {
            return Ok(Some(id));
        }
        let id = self.engine.get_authorized_dataset_by_name(&canonical, user).await?;
        if let Some(id) = id {
            self.register(&canonical, id);
        }
        Ok(id)
    }

    pub async fn list_entries(&self, alias: &str, user: &UserContext) -> Result<Vec<EngineRow>, ProbeError> {
        let canonical = alias_for(alias);
        Ok(self.engine.list_data(&canonical, user).await?)
    }

    pub async fn row_count(&self, alias: &str, user: &UserContext) -> Result<usize, ProbeError> {
        Ok(self.list_entries(alias, user).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachkb_engine::MockEngine;
    use std::sync::Arc;

    fn user() -> UserContext {
        UserContext("u".to_string())
    }

    #[test]
    fn alias_for_rewrites_legacy_prefixes() {
        assert_eq!(alias_for("client_42"), "kb_profile_42");
        assert_eq!(alias_for("kb_client_7"), "kb_profile_7");
        assert_eq!(alias_for("kb_profile_42"), "kb_profile_42");
        assert_eq!(alias_for("kb_global"), "kb_global");
    }

    #[test]
    fn alias_for_is_idempotent() {
        let once = alias_for("client_9");
        let twice = alias_for(&once);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn ensure_exists_creates_then_caches() {
        let engine = Arc::new(MockEngine::new());
        let registry = DatasetRegistry::new(engine.clone());
        let id1 = registry.ensure_exists("client_1", &user()).await.unwrap();
        let id2 = registry.ensure_exists("kb_profile_1", &user()).await.unwrap();
        assert_eq!(id1, id2);
    }
}
