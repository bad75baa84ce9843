// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end bridge scenarios through the public surface: once with a
//! scripted backend standing in for the OS transfer subsystem, once with the
//! bundled HTTP backend against a local socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use bgfetch::{
    BackgroundTransfer, BridgeConfig, BridgeError, DownloadBridge, DownloadEvent, DownloadRequest,
    HttpTransfer, TransferRequest, TransferSnapshot, TransferUpdate,
};

/// Backend that never moves bytes; tests drive callbacks through the update
/// channel themselves.
#[derive(Default)]
struct ScriptedBackend {
    submitted: Mutex<Vec<String>>,
}

#[async_trait]
impl BackgroundTransfer for ScriptedBackend {
    async fn submit(&self, request: TransferRequest) -> anyhow::Result<()> {
        self.submitted.lock().unwrap().push(request.id);
        Ok(())
    }

    async fn cancel(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pause(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resume(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn snapshot(&self) -> anyhow::Result<Vec<TransferSnapshot>> {
        Ok(Vec::new())
    }
}

async fn recv_event(events: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// The canonical lifecycle: enqueue, begin once, progress twice, complete
/// with the file moved into place and the record cleared.
#[tokio::test]
async fn full_lifecycle_with_scripted_backend() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("file.bin");
    let backend = Arc::new(ScriptedBackend::default());
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    let (bridge, mut events) = DownloadBridge::new(
        backend.clone(),
        updates_rx,
        dir.path().join("tasks.json"),
        BridgeConfig::default(),
    )
    .unwrap();

    bridge
        .enqueue(
            DownloadRequest::new("job1", "https://x/file.bin", destination.to_str().unwrap())
                .with_metadata("{\"a\":1}"),
        )
        .await
        .unwrap();
    assert_eq!(
        backend.submitted.lock().unwrap().as_slice(),
        ["job1".to_string()]
    );

    updates_tx
        .send(TransferUpdate::Progress {
            id: "job1".into(),
            bytes_downloaded: 10,
            bytes_total: 100,
        })
        .unwrap();
    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Begin { ref id, expected_bytes, .. }
            if id == "job1" && expected_bytes == 100
    ));
    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Progress { bytes_downloaded: 10, bytes_total: 100, .. }
    ));

    updates_tx
        .send(TransferUpdate::Progress {
            id: "job1".into(),
            bytes_downloaded: 50,
            bytes_total: 100,
        })
        .unwrap();
    // No second begin: straight to progress.
    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Progress { bytes_downloaded: 50, bytes_total: 100, .. }
    ));

    let os_file = dir.path().join("_osfile");
    std::fs::write(&os_file, b"final payload").unwrap();
    updates_tx
        .send(TransferUpdate::Finished {
            id: "job1".into(),
            temp_path: os_file.clone(),
        })
        .unwrap();

    match recv_event(&mut events).await {
        DownloadEvent::Done {
            id,
            location,
            metadata,
            ..
        } => {
            assert_eq!(id, "job1");
            assert_eq!(location, destination.to_str().unwrap());
            assert_eq!(metadata, "{\"a\":1}");
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(std::fs::read(&destination).unwrap(), b"final payload");
    assert!(!os_file.exists());

    // Terminal state removed the record: the id is free again and cancel
    // rejects it.
    let err = bridge.cancel("job1").await.unwrap_err();
    assert!(matches!(err, BridgeError::UnknownJobId(_)));

    bridge.shutdown().await.unwrap();
}

/// Out of the box there is no time gate: consecutive reports that each move
/// the completed fraction flow straight through.
#[tokio::test]
async fn back_to_back_progress_flows_under_default_config() {
    let dir = TempDir::new().unwrap();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (bridge, mut events) = DownloadBridge::new(
        Arc::new(ScriptedBackend::default()),
        updates_rx,
        dir.path().join("tasks.json"),
        BridgeConfig::default(),
    )
    .unwrap();

    bridge
        .enqueue(DownloadRequest::new("job1", "https://x/f", "/tmp/f"))
        .await
        .unwrap();

    for (downloaded, total) in [(10u64, 100u64), (50, 100)] {
        updates_tx
            .send(TransferUpdate::Progress {
                id: "job1".into(),
                bytes_downloaded: downloaded,
                bytes_total: total,
            })
            .unwrap();
    }

    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Begin { .. }
    ));
    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Progress { bytes_downloaded: 10, .. }
    ));
    assert!(matches!(
        recv_event(&mut events).await,
        DownloadEvent::Progress { bytes_downloaded: 50, .. }
    ));

    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_of_missing_job_is_a_typed_rejection() {
    let dir = TempDir::new().unwrap();
    let (_updates_tx, updates_rx) = mpsc::unbounded_channel::<TransferUpdate>();
    let (bridge, mut events) = DownloadBridge::new(
        Arc::new(ScriptedBackend::default()),
        updates_rx,
        dir.path().join("tasks.json"),
        BridgeConfig::default(),
    )
    .unwrap();

    let err = bridge.cancel("missingJob").await.unwrap_err();
    assert!(matches!(err, BridgeError::UnknownJobId(id) if id == "missingJob"));
    assert!(events.try_recv().is_err(), "no event may be emitted");
}

/// Records persisted by one bridge instance are visible to the next, the way
/// an OS-relaunched process sees them.
#[tokio::test]
async fn records_survive_bridge_restart() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("tasks.json");

    {
        let (_updates_tx, updates_rx) = mpsc::unbounded_channel::<TransferUpdate>();
        let (bridge, _events) = DownloadBridge::new(
            Arc::new(ScriptedBackend::default()),
            updates_rx,
            &store_path,
            BridgeConfig::default(),
        )
        .unwrap();
        bridge
            .enqueue(DownloadRequest::new("job1", "https://x/f", "/tmp/f"))
            .await
            .unwrap();
        bridge.shutdown().await.unwrap();
    }

    // Second instance: the persisted record makes the id a duplicate.
    let (_updates_tx, updates_rx) = mpsc::unbounded_channel::<TransferUpdate>();
    let (bridge, _events) = DownloadBridge::new(
        Arc::new(ScriptedBackend::default()),
        updates_rx,
        &store_path,
        BridgeConfig::default(),
    )
    .unwrap();
    let err = bridge
        .enqueue(DownloadRequest::new("job1", "https://x/f", "/tmp/f"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateJobId(_)));
}

/// Serve one canned HTTP response on a local socket.
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
async fn http_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("nested").join("file.bin");
    let url = one_shot_server(b"streamed through the bridge").await;

    let (backend, updates) = HttpTransfer::new();
    let (bridge, mut events) = DownloadBridge::new(
        backend,
        updates,
        dir.path().join("tasks.json"),
        BridgeConfig::default().with_progress_interval(Duration::ZERO),
    )
    .unwrap();

    let mut request = DownloadRequest::new("job1", &url, destination.to_str().unwrap());
    request.headers = HashMap::from([("X-Test".to_string(), "1".to_string())]);
    bridge.enqueue(request).await.unwrap();

    let mut saw_begin = false;
    loop {
        match recv_event(&mut events).await {
            DownloadEvent::Begin { expected_bytes, .. } => {
                assert_eq!(expected_bytes, 27);
                saw_begin = true;
            }
            DownloadEvent::Progress { .. } => {}
            DownloadEvent::Done { location, .. } => {
                assert_eq!(location, destination.to_str().unwrap());
                break;
            }
            DownloadEvent::Failed { error, .. } => panic!("download failed: {error}"),
        }
    }
    assert!(saw_begin);
    assert_eq!(
        std::fs::read(&destination).unwrap(),
        b"streamed through the bridge"
    );

    bridge.shutdown().await.unwrap();
}
