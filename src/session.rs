// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Relaunch session bookkeeping.
//!
//! When the OS relaunches a terminated process to deliver queued transfer
//! callbacks, it expects an explicit "background processing complete"
//! acknowledgment within a bounded window. Each relaunch registers a session
//! here: a counted barrier over the job ids still expecting a terminal
//! callback. The barrier fires once every job drains (or is explicitly
//! acknowledged by the application layer), and the bridge force-fires it at
//! the deadline rather than let the host miss the window.
//!
//! The registry is an explicit table owned by the bridge worker, created on
//! relaunch entry and cleared once acknowledged. It is not ambient global
//! state.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

#[derive(Debug)]
struct SessionEntry {
    outstanding: HashSet<String>,
    notify: oneshot::Sender<()>,
}

/// Handle returned from [`DownloadBridge::rehydrate`](crate::DownloadBridge::rehydrate).
/// Resolves once all outstanding callbacks for the session have drained or
/// the deadline fired.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: String,
    done: oneshot::Receiver<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the barrier. Never errors: a dropped bridge counts as
    /// acknowledged, since no more callbacks can arrive.
    pub async fn acknowledged(self) {
        let _ = self.done.await;
    }
}

/// Table of live relaunch sessions, keyed by the OS-supplied identifier.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session over `outstanding` job ids. An empty set fires the
    /// barrier immediately. Re-registering a session id replaces the old
    /// entry (its barrier fires, there is nothing left to wait for).
    pub fn register(
        &mut self,
        session_id: impl Into<String>,
        outstanding: HashSet<String>,
    ) -> SessionHandle {
        let session_id = session_id.into();
        let (notify, done) = oneshot::channel();

        if outstanding.is_empty() {
            let _ = notify.send(());
        } else {
            self.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    outstanding,
                    notify,
                },
            );
        }

        SessionHandle { session_id, done }
    }

    /// A job reached a terminal state; drop it from every session and fire
    /// the barriers that drained.
    pub fn job_done(&mut self, job_id: &str) {
        let drained: Vec<String> = self
            .sessions
            .iter_mut()
            .filter_map(|(session_id, entry)| {
                entry.outstanding.remove(job_id);
                entry.outstanding.is_empty().then(|| session_id.clone())
            })
            .collect();

        for session_id in drained {
            if let Some(entry) = self.sessions.remove(&session_id) {
                tracing::debug!(session = %session_id, "relaunch session drained");
                let _ = entry.notify.send(());
            }
        }
    }

    /// Explicit acknowledgment from the application layer that it finished
    /// processing one job's terminal event.
    pub fn acknowledge(&mut self, session_id: &str, job_id: &str) {
        let drained = match self.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.outstanding.remove(job_id);
                entry.outstanding.is_empty()
            }
            None => {
                tracing::debug!(session = %session_id, job = %job_id,
                    "acknowledgment for unknown session");
                return;
            }
        };

        if drained {
            if let Some(entry) = self.sessions.remove(session_id) {
                let _ = entry.notify.send(());
            }
        }
    }

    /// Deadline fallback. Fires the barrier regardless of outstanding jobs.
    /// Returns true if the session was still waiting.
    pub fn force_fire(&mut self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some(entry) => {
                let _ = entry.notify.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_session_fires_immediately() {
        let mut registry = SessionRegistry::new();
        let handle = registry.register("session-a", HashSet::new());
        handle.acknowledged().await;
    }

    #[tokio::test]
    async fn test_barrier_fires_when_last_job_drains() {
        let mut registry = SessionRegistry::new();
        let mut handle = registry.register("session-a", jobs(&["job1", "job2"]));

        registry.job_done("job1");
        assert!(handle.done.try_recv().is_err(), "one job still outstanding");

        registry.job_done("job2");
        handle.acknowledged().await;
    }

    #[tokio::test]
    async fn test_explicit_acknowledge_drains_job() {
        let mut registry = SessionRegistry::new();
        let handle = registry.register("session-a", jobs(&["job1"]));

        registry.acknowledge("session-a", "job1");
        handle.acknowledged().await;
    }

    #[tokio::test]
    async fn test_force_fire_reports_whether_session_was_waiting() {
        let mut registry = SessionRegistry::new();
        let handle = registry.register("session-a", jobs(&["job1"]));

        assert!(registry.force_fire("session-a"));
        assert!(!registry.force_fire("session-a"));
        handle.acknowledged().await;
    }

    #[tokio::test]
    async fn test_unrelated_job_does_not_fire_barrier() {
        let mut registry = SessionRegistry::new();
        let mut handle = registry.register("session-a", jobs(&["job1"]));

        registry.job_done("other");
        assert!(handle.done.try_recv().is_err());
    }
}
