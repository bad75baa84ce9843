// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The seam to the background-transfer subsystem.
//!
//! The bridge never moves bytes itself. It hands a [`TransferRequest`] to a
//! [`BackgroundTransfer`] implementation keyed by the job id and consumes
//! [`TransferUpdate`]s from a channel the backend writes to. On a platform
//! with an OS download manager the implementation is a shim over it; the
//! bundled [`http::HttpTransfer`] delegates to reqwest for hosts without one.
//!
//! Contract per submitted transfer: at most one `Started` first, zero or
//! more `Progress`, then exactly one of `Finished` / `Failed`. A cancelled
//! transfer may emit nothing further.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::task::TaskState;

pub mod http;

pub use http::HttpTransfer;

/// A transfer submission, keyed by the job id so later callbacks can be
/// joined back to the persisted record.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// A callback from the transfer subsystem.
#[derive(Debug, Clone)]
pub enum TransferUpdate {
    /// The remote answered; byte counters are about to move.
    Started {
        id: String,
        headers: HashMap<String, String>,
        expected_bytes: u64,
    },
    /// Byte counters advanced. `bytes_total` is 0 when unknown.
    Progress {
        id: String,
        bytes_downloaded: u64,
        bytes_total: u64,
    },
    /// The transfer finished; the payload sits at `temp_path` until the
    /// bridge moves it to its destination.
    Finished { id: String, temp_path: PathBuf },
    /// The transfer failed. Terminal.
    Failed {
        id: String,
        code: Option<i64>,
        message: String,
    },
}

impl TransferUpdate {
    pub fn id(&self) -> &str {
        match self {
            TransferUpdate::Started { id, .. }
            | TransferUpdate::Progress { id, .. }
            | TransferUpdate::Finished { id, .. }
            | TransferUpdate::Failed { id, .. } => id,
        }
    }
}

/// A transfer the backend still knows about, reported during relaunch
/// reconciliation.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: String,
    pub state: TaskState,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    /// Where a `Completed` transfer left its payload
    pub local_path: Option<PathBuf>,
}

/// The background-transfer subsystem. External collaborator; the bridge
/// delegates all network work here and only shadows its state.
#[async_trait]
pub trait BackgroundTransfer: Send + Sync {
    /// Begin a transfer. Callbacks for it arrive on the updates channel
    /// carrying `request.id`.
    async fn submit(&self, request: TransferRequest) -> Result<()>;

    /// Abort a transfer. No further updates arrive for the id.
    async fn cancel(&self, id: &str) -> Result<()>;

    /// Suspend a transfer. Backends without pause support reject this.
    async fn pause(&self, id: &str) -> Result<()>;

    /// Resume a suspended transfer.
    async fn resume(&self, id: &str) -> Result<()>;

    /// Transfers this backend still knows about, used to re-associate
    /// persisted records after a process relaunch.
    async fn snapshot(&self) -> Result<Vec<TransferSnapshot>>;
}
