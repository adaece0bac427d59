//! Interface to the third-party vector+graph indexing engine (spec §6.3).
//!
//! The real engine (a Python package in production) is an external
//! collaborator; this crate defines only the surface our core subsystems
//! call through, plus an in-memory [`MockEngine`] so the rest of the
//! workspace can be unit-tested without a live engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Opaque user/session context threaded through every engine call. The real
/// engine accepts a framework-specific user object; we only need to carry it
/// by value and compare identity for session scoping (spec §4.F step 6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserContext(pub String);

/// Opaque identifier assigned by the engine per dataset (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub Uuid);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row as returned by `datasets.list_data` (spec §6.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineRow {
    pub text: String,
    pub metadata: JsonValue,
}

/// A single search hit as returned by the engine's `search` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub metadata: JsonValue,
}

/// Mirrors `cognee.modules.search.types.SearchType` (spec §4.F step 7); only
/// the query type the core ever issues is represented, others are left out
/// as non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    GraphCompletionContextExtension,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine dataset storage file not found: {0}")]
    FileNotFound(String),
    #[error("engine database not created yet")]
    SetupRequired,
    #[error("engine dataset not found: {0}")]
    DatasetNotFound(String),
    #[error("engine call failed: {0}")]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The subset of the external engine's surface our core subsystems call
/// through (spec §6.3). Implementations must be `Send + Sync` so the core
/// can hold one behind an `Arc` and call it from any worker task.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn add(
        &self,
        text: &str,
        dataset_name: &str,
        user: &UserContext,
        node_set: Option<&[String]>,
    ) -> EngineResult<DatasetId>;

    /// Build (or rebuild) the vector+graph index for one dataset. May raise
    /// `EngineError::FileNotFound` when the on-disk storage backing the
    /// dataset was lost (spec §4.E `project`).
    async fn cognify(&self, dataset: &str, user: &UserContext) -> EngineResult<()>;

    async fn search(
        &self,
        query: &str,
        datasets: &[String],
        user: &UserContext,
        session_id: Option<&str>,
        top_k: usize,
        query_type: QueryType,
    ) -> EngineResult<Vec<SearchHit>>;

    async fn list_data(&self, dataset: &str, user: &UserContext) -> EngineResult<Vec<EngineRow>>;

    async fn get_authorized_dataset_by_name(
        &self,
        name: &str,
        user: &UserContext,
    ) -> EngineResult<Option<DatasetId>>;

    async fn create_authorized_dataset(
        &self,
        name: &str,
        user: &UserContext,
    ) -> EngineResult<DatasetId>;

    /// One-time database bootstrap invoked when the engine reports a
    /// "database not created" condition (spec §7 Setup/bootstrap).
    async fn setup(&self) -> EngineResult<()>;

    /// Optional post-index enrichment step (spec §4.F step 9, §9 Open
    /// Questions). A no-op default lets implementations skip it entirely.
    async fn memify(&self, _datasets: &[String], _user: &UserContext) -> EngineResult<()> {
        Ok(())
    }
}

/// In-memory stand-in for the external engine, used by unit tests across
/// the workspace (storage heal, projection probe, search fan-out).
#[derive(Default)]
pub struct MockEngine {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    datasets: HashMap<String, DatasetId>,
    rows: HashMap<String, Vec<EngineRow>>,
    cognified: HashMap<String, bool>,
    setup_called: bool,
    fail_cognify_with_missing_file: HashMap<String, String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_rows(&self, dataset: &str, rows: Vec<EngineRow>) {
        let mut state = self.inner.lock().unwrap();
        state
            .datasets
            .entry(dataset.to_string())
            .or_insert_with(|| DatasetId(Uuid::new_v4()));
        state.rows.entry(dataset.to_string()).or_default().extend(rows);
    }

    pub fn is_cognified(&self, dataset: &str) -> bool {
        let state = self.inner.lock().unwrap();
        state.cognified.get(dataset).copied().unwrap_or(false)
    }

    pub fn setup_was_called(&self) -> bool {
        self.inner.lock().unwrap().setup_called
    }

    /// Arrange for the next `cognify(dataset, ..)` call to fail with
    /// `FileNotFound(missing)`, simulating lost on-disk storage (spec §4.E).
    pub fn fail_next_cognify_with_missing_file(&self, dataset: &str, missing: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_cognify_with_missing_file
            .insert(dataset.to_string(), missing.to_string());
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn add(
        &self,
        text: &str,
        dataset_name: &str,
        _user: &UserContext,
        node_set: Option<&[String]>,
    ) -> EngineResult<DatasetId> {
        let mut state = self.inner.lock().unwrap();
        let id = *state
            .datasets
            .entry(dataset_name.to_string())
            .or_insert_with(|| DatasetId(Uuid::new_v4()));
        let metadata = serde_json::json!({ "node_set": node_set });
        state
            .rows
            .entry(dataset_name.to_string())
            .or_default()
            .push(EngineRow { text: text.to_string(), metadata });
        Ok(id)
    }

    async fn cognify(&self, dataset: &str, _user: &UserContext) -> EngineResult<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(missing) = state.fail_cognify_with_missing_file.remove(dataset) {
            return Err(EngineError::FileNotFound(missing));
        }
        state.cognified.insert(dataset.to_string(), true);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        datasets: &[String],
        _user: &UserContext,
        _session_id: Option<&str>,
        top_k: usize,
        _query_type: QueryType,
    ) -> EngineResult<Vec<SearchHit>> {
        let state = self.inner.lock().unwrap();
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for dataset in datasets {
            if !state.cognified.get(dataset).copied().unwrap_or(false) {
                continue;
            }
            if let Some(rows) = state.rows.get(dataset) {
                for row in rows {
                    if row.text.to_lowercase().contains(&needle) {
                        let mut metadata = row.metadata.clone();
                        if let Some(obj) = metadata.as_object_mut() {
                            obj.insert("dataset".to_string(), serde_json::json!(dataset));
                        }
                        hits.push(SearchHit { text: row.text.clone(), metadata });
                    }
                }
            }
        }
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn list_data(&self, dataset: &str, _user: &UserContext) -> EngineResult<Vec<EngineRow>> {
        let state = self.inner.lock().unwrap();
        Ok(state.rows.get(dataset).cloned().unwrap_or_default())
    }

    async fn get_authorized_dataset_by_name(
        &self,
        name: &str,
        _user: &UserContext,
    ) -> EngineResult<Option<DatasetId>> {
        let state = self.inner.lock().unwrap();
        Ok(state.datasets.get(name).copied())
    }

    async fn create_authorized_dataset(
        &self,
        name: &str,
        _user: &UserContext,
    ) -> EngineResult<DatasetId> {
        let mut state = self.inner.lock().unwrap();
        let id = *state
            .datasets
            .entry(name.to_string())
            .or_insert_with(|| DatasetId(Uuid::new_v4()));
        Ok(id)
    }

    async fn setup(&self) -> EngineResult<()> {
        self.inner.lock().unwrap().setup_called = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserContext {
        UserContext("test-user".to_string())
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let engine = MockEngine::new();
        engine.add("hello world", "kb_global", &user(), None).await.unwrap();
        let rows = engine.list_data("kb_global", &user()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "hello world");
    }

    #[tokio::test]
    async fn search_requires_cognify_first() {
        let engine = MockEngine::new();
        engine.add("squat progression plan", "kb_global", &user(), None).await.unwrap();
        let hits = engine
            .search("squat", &["kb_global".to_string()], &user(), None, 5, QueryType::GraphCompletionContextExtension)
            .await
            .unwrap();
        assert!(hits.is_empty(), "search before cognify should find nothing");

        engine.cognify("kb_global", &user()).await.unwrap();
        let hits = engine
            .search("squat", &["kb_global".to_string()], &user(), None, 5, QueryType::GraphCompletionContextExtension)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn cognify_missing_file_surfaces_error() {
        let engine = MockEngine::new();
        engine.fail_next_cognify_with_missing_file("kb_global", "text_deadbeef.txt");
        let err = engine.cognify("kb_global", &user()).await.unwrap_err();
        assert!(matches!(err, EngineError::FileNotFound(_)));
    }
}
