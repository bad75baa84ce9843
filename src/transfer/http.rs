// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reference transfer backend over plain HTTP.
//!
//! A thin delegate for hosts without an OS download manager: one streaming
//! GET per transfer into a temp file, progress relayed per chunk. No retry,
//! no ranges, no queueing. Pause and resume are not supported by this
//! backend and are rejected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BackgroundTransfer, TransferRequest, TransferSnapshot, TransferUpdate};
use crate::task::TaskState;

#[derive(Debug, Default)]
struct TransferCounters {
    bytes_downloaded: AtomicU64,
    bytes_total: AtomicU64,
}

struct LiveTransfer {
    worker: JoinHandle<()>,
    counters: Arc<TransferCounters>,
}

pub struct HttpTransfer {
    client: reqwest::Client,
    updates: mpsc::UnboundedSender<TransferUpdate>,
    live: Arc<Mutex<HashMap<String, LiveTransfer>>>,
}

impl HttpTransfer {
    /// Build the backend and the update channel the bridge consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransferUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            client: reqwest::Client::new(),
            updates: updates_tx,
            live: Arc::new(Mutex::new(HashMap::new())),
        });
        (backend, updates_rx)
    }

    fn temp_path(id: &str) -> PathBuf {
        let slug: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!(
            "bgfetch-{}-{}.part",
            slug,
            std::process::id()
        ))
    }

    async fn run_transfer(
        client: reqwest::Client,
        request: TransferRequest,
        updates: mpsc::UnboundedSender<TransferUpdate>,
        counters: Arc<TransferCounters>,
    ) -> Result<PathBuf> {
        let mut get = client.get(&request.url);
        for (key, value) in &request.headers {
            get = get.header(key.as_str(), value.as_str());
        }

        let response = get
            .send()
            .await
            .with_context(|| format!("request to {} failed", request.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("server answered {}", status);
        }

        let expected = response.content_length().unwrap_or(0);
        counters.bytes_total.store(expected, Ordering::Relaxed);

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let _ = updates.send(TransferUpdate::Started {
            id: request.id.clone(),
            headers,
            expected_bytes: expected,
        });

        let temp_path = Self::temp_path(&request.id);
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create temp file {:?}", temp_path))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| "transfer stream broke")?;
            file.write_all(&chunk)
                .await
                .with_context(|| "failed to write transfer chunk")?;
            downloaded += chunk.len() as u64;
            counters.bytes_downloaded.store(downloaded, Ordering::Relaxed);
            let _ = updates.send(TransferUpdate::Progress {
                id: request.id.clone(),
                bytes_downloaded: downloaded,
                bytes_total: expected,
            });
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(temp_path)
    }
}

#[async_trait]
impl BackgroundTransfer for HttpTransfer {
    async fn submit(&self, request: TransferRequest) -> Result<()> {
        let id = request.id.clone();
        let client = self.client.clone();
        let updates = self.updates.clone();
        let counters = Arc::new(TransferCounters::default());
        let worker_counters = counters.clone();
        let table = self.live.clone();
        let worker_id = id.clone();

        // The lock is held across spawn + insert: a fast-failing worker
        // cannot reach its table cleanup before the entry exists.
        let mut live = self.live.lock().expect("transfer table poisoned");
        if live.contains_key(&id) {
            bail!("transfer `{}` is already running", id);
        }

        let worker = tokio::spawn(async move {
            let outcome =
                Self::run_transfer(client, request, updates.clone(), worker_counters).await;
            // Drop the entry before the terminal update goes out, so a
            // snapshot taken after the update never reports the transfer
            // as still live.
            table
                .lock()
                .expect("transfer table poisoned")
                .remove(&worker_id);
            let update = match outcome {
                Ok(temp_path) => TransferUpdate::Finished {
                    id: worker_id.clone(),
                    temp_path,
                },
                Err(e) => {
                    tracing::warn!(id = %worker_id, error = %e, "http transfer failed");
                    TransferUpdate::Failed {
                        id: worker_id,
                        code: None,
                        message: format!("{:#}", e),
                    }
                }
            };
            let _ = updates.send(update);
        });

        live.insert(id, LiveTransfer { worker, counters });
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let removed = self.live.lock().expect("transfer table poisoned").remove(id);
        match removed {
            Some(live) => {
                live.worker.abort();
                // Wait out the abort so the worker's file handle is gone,
                // then clear the partial payload.
                let _ = live.worker.await;
                let _ = tokio::fs::remove_file(Self::temp_path(id)).await;
                Ok(())
            }
            None => Err(anyhow!("no running transfer `{}`", id)),
        }
    }

    async fn pause(&self, _id: &str) -> Result<()> {
        Err(anyhow!("pause is not supported by the http backend"))
    }

    async fn resume(&self, _id: &str) -> Result<()> {
        Err(anyhow!("resume is not supported by the http backend"))
    }

    async fn snapshot(&self) -> Result<Vec<TransferSnapshot>> {
        let live = self.live.lock().expect("transfer table poisoned");
        Ok(live
            .iter()
            .map(|(id, transfer)| TransferSnapshot {
                id: id.clone(),
                state: TaskState::Running,
                bytes_downloaded: transfer.counters.bytes_downloaded.load(Ordering::Relaxed),
                bytes_total: transfer.counters.bytes_total.load(Ordering::Relaxed),
                local_path: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response, then close.
    async fn one_shot_server(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_submit_streams_body_and_reports_lifecycle() {
        let url = one_shot_server(b"hello world").await;
        let (backend, mut updates) = HttpTransfer::new();

        backend
            .submit(TransferRequest {
                id: "job1".to_string(),
                url,
                headers: HashMap::new(),
            })
            .await
            .unwrap();

        let mut started = false;
        let mut finished_at = None;
        while let Some(update) = updates.recv().await {
            match update {
                TransferUpdate::Started { id, expected_bytes, .. } => {
                    assert_eq!(id, "job1");
                    assert_eq!(expected_bytes, 11);
                    started = true;
                }
                TransferUpdate::Progress { bytes_total, .. } => {
                    assert_eq!(bytes_total, 11);
                }
                TransferUpdate::Finished { id, temp_path } => {
                    assert_eq!(id, "job1");
                    finished_at = Some(temp_path);
                    break;
                }
                TransferUpdate::Failed { message, .. } => panic!("transfer failed: {message}"),
            }
        }

        assert!(started);
        let temp_path = finished_at.expect("finished update");
        let body = std::fs::read_to_string(&temp_path).unwrap();
        assert_eq!(body, "hello world");
        let _ = std::fs::remove_file(temp_path);
    }

    /// Serve headers and a partial body, then hold the socket open so the
    /// transfer never finishes on its own.
    async fn stalling_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_no_snapshot_entry() {
        // Bind, grab the address, drop the listener: connection refused,
        // so the worker fails about as fast as a transfer can.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let (backend, mut updates) = HttpTransfer::new();
        backend
            .submit(TransferRequest {
                id: "job1".to_string(),
                url,
                headers: HashMap::new(),
            })
            .await
            .unwrap();

        match updates.recv().await {
            Some(TransferUpdate::Failed { id, .. }) => assert_eq!(id, "job1"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(backend.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_removes_partial_file() {
        let url = stalling_server().await;
        let (backend, mut updates) = HttpTransfer::new();
        backend
            .submit(TransferRequest {
                id: "jobcancel".to_string(),
                url,
                headers: HashMap::new(),
            })
            .await
            .unwrap();

        // Wait until bytes hit the temp file.
        loop {
            match updates.recv().await {
                Some(TransferUpdate::Progress { .. }) => break,
                Some(_) => {}
                None => panic!("update stream closed"),
            }
        }
        let temp = HttpTransfer::temp_path("jobcancel");
        assert!(temp.exists());

        backend.cancel("jobcancel").await.unwrap();
        assert!(!temp.exists());
        assert!(backend.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_is_rejected() {
        let (backend, _updates) = HttpTransfer::new();
        assert!(backend.pause("job1").await.is_err());
        assert!(backend.resume("job1").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_transfer_is_an_error() {
        let (backend, _updates) = HttpTransfer::new();
        assert!(backend.cancel("ghost").await.is_err());
    }
}
