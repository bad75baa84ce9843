// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! bgfetch - background download bridge
//!
//! Enqueue, persist, and observe OS-managed background file downloads. The
//! bridge performs no transfers itself: it hands jobs to a pluggable
//! [`transfer::BackgroundTransfer`] backend, shadows the backend's state in a
//! durable record set, and republishes its callbacks as application-level
//! events. Jobs survive process termination; when the host is relaunched to
//! receive leftover callbacks, [`DownloadBridge::rehydrate`] joins them back
//! to their records and tells the host when background work is drained.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ commands  ┌─────────────────┐ submit  ┌──────────────┐
//! │ DownloadBridge  │──────────▶│  bridge worker  │────────▶│ Background   │
//! │ (app-facing)    │           │  (single actor) │◀────────│ Transfer     │
//! └─────────────────┘           └────────┬────────┘ updates └──────────────┘
//!          ▲                             │
//!          │ DownloadEvent      ┌────────▼────────┐
//!          └────────────────────│   TaskStore     │
//!                               │  (persistent)   │
//!                               └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use bgfetch::{BridgeConfig, DownloadBridge, DownloadRequest, HttpTransfer, TaskStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (backend, updates) = HttpTransfer::new();
//! let (bridge, mut events) = DownloadBridge::new(
//!     backend,
//!     updates,
//!     TaskStore::default_path(),
//!     BridgeConfig::default(),
//! )?;
//!
//! bridge
//!     .enqueue(DownloadRequest::new("job1", "https://example.com/f.bin", "/tmp/f.bin"))
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod store;
pub mod task;
pub mod transfer;

// Re-export commonly used items
pub use bridge::DownloadBridge;
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use events::DownloadEvent;
pub use session::SessionHandle;
pub use store::TaskStore;
pub use task::{DownloadRequest, ExistingDownload, TaskConfig, TaskState};
pub use transfer::{
    BackgroundTransfer, HttpTransfer, TransferRequest, TransferSnapshot, TransferUpdate,
};
