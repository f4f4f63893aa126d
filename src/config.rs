//! Editor and adapter configuration.
//!
//! Resolved once by the host and passed into sessions and adapters; nothing
//! in this crate reads the process environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When picked files reach the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Hold files locally and upload them during commit.
    #[default]
    Deferred,
    /// Upload as soon as a file is attached; undo the upload on rollback.
    Eager,
}

/// Per-session editor policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Largest accepted attachment in bytes.
    pub max_file_bytes: u64,
    /// Accepted MIME types.
    pub allowed_mime_types: Vec<String>,
    /// Accepted lowercase extensions without the dot.
    pub allowed_extensions: Vec<String>,
    /// Upload strategy for the whole session.
    pub upload_strategy: UploadStrategy,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            allowed_mime_types: [
                "application/pdf",
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "application/msword",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_extensions: ["pdf", "jpg", "jpeg", "png", "gif", "webp", "doc", "docx"]
                .into_iter()
                .map(String::from)
                .collect(),
            upload_strategy: UploadStrategy::Deferred,
        }
    }
}

impl EditorConfig {
    /// True when `mime_type` is on the allow-list (case-insensitive).
    pub fn allows_mime(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
    }

    /// True when the extension of `file_name` is on the allow-list.
    pub fn allows_extension(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Connection settings shared by the HTTP adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL without trailing slash, e.g. `https://portal.example/api`.
    pub base_url: String,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl HttpConfig {
    /// Builds a config with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Joins `path` onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}
