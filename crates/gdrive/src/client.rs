//! Abstract Google Drive surface (spec §4.H). No real Drive API crate sits
//! in the dependency stack, so callers provide an implementation; tests use
//! [`MockDriveClient`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub modified_time: String,
    pub is_folder: bool,
}

pub struct DriveListPage {
    pub items: Vec<DriveItem>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("retryable drive error: {0}")]
    Retryable(String),
    #[error("non-retryable drive error: {0}")]
    NonRetryable(String),
}

impl DriveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriveError::Retryable(_))
    }
}

/// The subset of the Drive v3 API this loader needs: paged folder listing
/// and whole-file download.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<DriveListPage, DriveError>;

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError>;
}

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

pub fn is_folder_mime(mime_type: &str) -> bool {
    mime_type.trim().eq_ignore_ascii_case(FOLDER_MIME_TYPE)
}

/// Joins a POSIX-style relative path the way the original scanner does:
/// trims slashes off both sides, drops whichever side is empty.
pub fn join_kb_path(parent: &str, name: &str) -> String {
    let parent = parent.trim().trim_matches('/');
    let name = name.trim().trim_matches('/');
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{name}"),
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockDriveClient {
        children: Mutex<HashMap<String, Vec<DriveItem>>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        fail_downloads_then_succeed: Mutex<HashMap<String, u32>>,
    }

    impl MockDriveClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_folder(&self, folder_id: &str, items: Vec<DriveItem>) {
            self.children.lock().unwrap().insert(folder_id.to_string(), items);
        }

        pub fn add_file(&self, file_id: &str, data: Vec<u8>) {
            self.files.lock().unwrap().insert(file_id.to_string(), data);
        }

        pub fn fail_downloads_then_succeed(&self, file_id: &str, times: u32) {
            self.fail_downloads_then_succeed
                .lock()
                .unwrap()
                .insert(file_id.to_string(), times);
        }
    }

    #[async_trait]
    impl DriveClient for MockDriveClient {
        async fn list_children(
            &self,
            folder_id: &str,
            _page_token: Option<&str>,
        ) -> Result<DriveListPage, DriveError> {
            let items = self.children.lock().unwrap().get(folder_id).cloned().unwrap_or_default();
            Ok(DriveListPage { items, next_page_token: None })
        }

        async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError> {
            let mut remaining = self.fail_downloads_then_succeed.lock().unwrap();
            if let Some(count) = remaining.get_mut(file_id) {
                if *count > 0 {
                    *count -= 1;
                    return Err(DriveError::Retryable("simulated transient failure".to_string()));
                }
            }
            self.files
                .lock()
                .unwrap()
                .get(file_id)
                .cloned()
                .ok_or_else(|| DriveError::NonRetryable(format!("no such file: {file_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_kb_path_handles_empty_sides() {
        assert_eq!(join_kb_path("", "a.txt"), "a.txt");
        assert_eq!(join_kb_path("docs", ""), "docs");
        assert_eq!(join_kb_path("docs", "a.txt"), "docs/a.txt");
        assert_eq!(join_kb_path("/docs/", "/a.txt/"), "docs/a.txt");
    }

    #[test]
    fn is_folder_mime_is_case_insensitive() {
        assert!(is_folder_mime("application/vnd.google-apps.folder"));
        assert!(is_folder_mime("APPLICATION/VND.GOOGLE-APPS.FOLDER"));
        assert!(!is_folder_mime("text/plain"));
    }
}
