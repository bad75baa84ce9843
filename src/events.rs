// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application-facing download events.
//!
//! The bridge republishes backend callbacks as this vocabulary. Ordering per
//! job id is: at most one [`Begin`](DownloadEvent::Begin), zero or more
//! [`Progress`](DownloadEvent::Progress), then exactly one of
//! [`Done`](DownloadEvent::Done) / [`Failed`](DownloadEvent::Failed).
//! A cancelled job emits nothing further.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DownloadEvent {
    /// The transfer has started moving bytes. Emitted at most once per job,
    /// even across process relaunches.
    #[serde(rename_all = "camelCase")]
    Begin {
        id: String,
        expected_bytes: u64,
        /// Response headers, when the backend surfaces them
        headers: HashMap<String, String>,
    },

    /// Byte counters advanced. `bytes_total` is 0 when the size is unknown.
    #[serde(rename_all = "camelCase")]
    Progress {
        id: String,
        bytes_downloaded: u64,
        bytes_total: u64,
    },

    /// The completed file is in place at `location`.
    #[serde(rename_all = "camelCase")]
    Done {
        id: String,
        location: String,
        metadata: String,
        bytes_downloaded: u64,
        bytes_total: u64,
    },

    /// Terminal failure. The job will not be retried.
    #[serde(rename_all = "camelCase")]
    Failed {
        id: String,
        error: String,
        error_code: Option<i64>,
    },
}

impl DownloadEvent {
    /// The job id this event belongs to.
    pub fn id(&self) -> &str {
        match self {
            DownloadEvent::Begin { id, .. }
            | DownloadEvent::Progress { id, .. }
            | DownloadEvent::Done { id, .. }
            | DownloadEvent::Failed { id, .. } => id,
        }
    }

    /// True for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Done { .. } | DownloadEvent::Failed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        let begin = DownloadEvent::Begin {
            id: "a".into(),
            expected_bytes: 10,
            headers: HashMap::new(),
        };
        let done = DownloadEvent::Done {
            id: "a".into(),
            location: "/tmp/f".into(),
            metadata: "{}".into(),
            bytes_downloaded: 10,
            bytes_total: 10,
        };
        assert!(!begin.is_terminal());
        assert!(done.is_terminal());
        assert_eq!(done.id(), "a");
    }

    #[test]
    fn test_events_serialize_with_camel_case_payloads() {
        let event = DownloadEvent::Progress {
            id: "job1".into(),
            bytes_downloaded: 10,
            bytes_total: 100,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["bytesDownloaded"], 10);
        assert_eq!(json["bytesTotal"], 100);
    }
}
