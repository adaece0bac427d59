pub mod content_store;
pub mod dataset_registry;
pub mod hash_store;
pub mod service;
pub mod text;

pub use content_store::ContentStore;
pub use dataset_registry::{alias_for, chat_dataset_name, dataset_name, is_chat_dataset, DatasetRegistry, ProbeError};
pub use hash_store::{HashStore, SanitizeReport};
pub use service::{DatasetUpdater, DiskRebuildSummary, RebuildResult, StorageDiagnostics, StorageService};
pub use text::{normalize_text, sanitize_text};
