// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bridge configuration.
//!
//! Progress reporting is throttled so a chatty backend does not flood the
//! application layer: a report goes out when the completed fraction moves by
//! more than one percent, or enough new bytes arrived, or the total size is
//! unknown. When an interval is configured, reports are additionally spaced
//! by `progress_interval` per job; a threshold-met report landing inside the
//! window is deferred to the next callback after it, never dropped. The
//! interval gate is off by default, and the first report for a job is never
//! suppressed (it carries the begin signal).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Floor for a configured `progress_interval`, matching the narrowest
/// interval the application layer is expected to render.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Minimum spacing between progress events for one job. Zero (the
    /// default) disables the time gate.
    #[serde(with = "duration_millis", default = "default_progress_interval")]
    pub progress_interval: Duration,
    /// Minimum byte delta that forces a progress event through the throttle
    #[serde(default = "default_progress_min_bytes")]
    pub progress_min_bytes: u64,
    /// Headers attached to every submitted transfer, merged under
    /// per-request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// How long a relaunch session may stay unacknowledged before the
    /// barrier force-fires. The OS grants a bounded window for the
    /// "background processing complete" acknowledgment; this must stay
    /// inside it.
    #[serde(with = "duration_millis", default = "default_ack_deadline")]
    pub ack_deadline: Duration,
}

fn default_progress_interval() -> Duration {
    Duration::ZERO
}

fn default_progress_min_bytes() -> u64 {
    1024 * 1024
}

fn default_ack_deadline() -> Duration {
    Duration::from_secs(25)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            progress_interval: default_progress_interval(),
            progress_min_bytes: default_progress_min_bytes(),
            headers: HashMap::new(),
            ack_deadline: default_ack_deadline(),
        }
    }
}

impl BridgeConfig {
    /// Set the progress interval, clamped to [`MIN_PROGRESS_INTERVAL`].
    /// A zero interval (the default) disables the time gate entirely.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = if interval.is_zero() {
            interval
        } else {
            interval.max(MIN_PROGRESS_INTERVAL)
        };
        self
    }

    pub fn with_progress_min_bytes(mut self, min_bytes: u64) -> Self {
        self.progress_min_bytes = min_bytes;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = deadline;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
