// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed errors for caller-invoked bridge operations.
//!
//! Only the application-facing surface (enqueue, cancel, pause, resume,
//! rehydrate) fails with these. Backend callbacks never propagate errors
//! outward; they degrade to logging or a `Failed` event, because an uncaught
//! failure on the callback path can stop the backend from delivering further
//! callbacks.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Enqueue reused an id that still has an active record.
    #[error("a download with id `{0}` already exists")]
    DuplicateJobId(String),

    /// Cancel/pause/resume referenced an id with no record.
    #[error("no download with id `{0}` is known")]
    UnknownJobId(String),

    /// Enqueue was missing a required field.
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    /// The persisted record set could not be read or written.
    #[error("task store error: {0}")]
    Store(String),

    /// The transfer backend rejected an instruction.
    #[error("transfer backend error: {0}")]
    Transfer(String),

    /// The bridge worker has shut down.
    #[error("download bridge is no longer running")]
    Closed,
}
