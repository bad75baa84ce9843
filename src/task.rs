// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task types for the background download bridge.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable record for one download job.
///
/// This is the only entity that survives process termination. The transfer
/// backend is keyed by `id` as well, so a callback arriving after a relaunch
/// can be joined back to this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Caller-assigned unique job identifier
    #[serde(default)]
    pub id: String,
    /// Source resource location
    pub url: String,
    /// Local path the completed file is moved to
    pub destination: String,
    /// Opaque caller-defined payload, passed through untouched.
    /// Conventionally a JSON-encoded object.
    #[serde(default = "default_metadata")]
    pub metadata: String,
    /// True once a begin event has been delivered for this job.
    /// Gates duplicate begin notifications across relaunches.
    #[serde(default)]
    pub reported_begin: bool,
    /// When the job was enqueued
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_metadata() -> String {
    "{}".to_string()
}

impl TaskConfig {
    /// Create a new record for a freshly enqueued job.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            destination: destination.into(),
            metadata: metadata.into(),
            reported_begin: false,
            created_at: Utc::now(),
        }
    }

    /// Build a record from a plain key/value map.
    ///
    /// Absent keys default (`metadata` to `"{}"`, everything else to empty);
    /// no validation beyond presence is performed here. Malformed URLs or
    /// destinations are the bridge's concern, not the record's.
    pub fn from_map(dict: &HashMap<String, String>) -> Self {
        Self::new(
            dict.get("id").cloned().unwrap_or_default(),
            dict.get("url").cloned().unwrap_or_default(),
            dict.get("destination").cloned().unwrap_or_default(),
            dict.get("metadata").cloned().unwrap_or_else(default_metadata),
        )
    }
}

/// An enqueue request from the application layer.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    /// Caller-assigned unique job identifier
    pub id: String,
    /// Source URL
    pub url: String,
    /// Local destination path for the completed file
    pub destination: String,
    /// Opaque metadata returned in events (conventionally JSON)
    pub metadata: String,
    /// Extra request headers, merged over the configured defaults
    pub headers: HashMap<String, String>,
}

impl DownloadRequest {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            destination: destination.into(),
            metadata: default_metadata(),
            headers: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Coarse state of a transfer as reported by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Transfer is pending or actively moving bytes
    Running,
    /// Transfer is paused by the host or the OS
    Suspended,
    /// Transfer is being torn down
    Canceling,
    /// Transfer finished; terminal callback may still be pending
    Completed,
}

/// One row of [`DownloadBridge::list_existing`](crate::DownloadBridge::list_existing):
/// a persisted job matched against a transfer the backend still knows about.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExistingDownload {
    pub id: String,
    pub metadata: String,
    pub state: TaskState,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_starts_unreported() {
        let config = TaskConfig::new("job1", "https://x/f.bin", "/tmp/f.bin", "{\"a\":1}");
        assert_eq!(config.id, "job1");
        assert_eq!(config.metadata, "{\"a\":1}");
        assert!(!config.reported_begin);
    }

    #[test]
    fn test_from_map_fills_defaults() {
        let mut dict = HashMap::new();
        dict.insert("id".to_string(), "job1".to_string());
        dict.insert("url".to_string(), "https://x/f.bin".to_string());
        dict.insert("destination".to_string(), "/tmp/f.bin".to_string());

        let config = TaskConfig::from_map(&dict);
        assert_eq!(config.id, "job1");
        assert_eq!(config.url, "https://x/f.bin");
        assert_eq!(config.destination, "/tmp/f.bin");
        assert_eq!(config.metadata, "{}");
        assert!(!config.reported_begin);
    }

    #[test]
    fn test_serde_round_trip_is_lossless() {
        let mut config = TaskConfig::new("job1", "https://x/f.bin", "/tmp/f.bin", "{\"a\":1}");
        config.reported_begin = true;

        let json = serde_json::to_string(&config).unwrap();
        let restored: TaskConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_deserialize_missing_metadata_defaults_to_empty_object() {
        let json = r#"{"id":"job1","url":"https://x/f.bin","destination":"/tmp/f.bin"}"#;
        let config: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.metadata, "{}");
    }

    #[test]
    fn test_deserialize_missing_id_defaults_to_empty_string() {
        let json = r#"{"url":"https://x/f.bin","destination":"/tmp/f.bin","metadata":"{}"}"#;
        let config: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.id, "");
    }

    #[test]
    fn test_deserialize_missing_reported_begin_defaults_to_false() {
        let json = r#"{"id":"a","url":"u","destination":"d","metadata":"{}"}"#;
        let config: TaskConfig = serde_json::from_str(json).unwrap();
        assert!(!config.reported_begin);
    }
}
