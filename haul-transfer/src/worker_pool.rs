//! Worker Pool: the bounded set of parallel upload workers (§4.6).
//!
//! Each worker repeats the pause-gate → dequeue → resolve-URL → read → PUT →
//! persist-receipt → backoff/requeue loop described in the spec, publishing
//! `chunk` events over a channel the Control Surface subscribes to (no
//! back-pointer from workers into the surface — §9).

use crate::file_reader::FileReader;
use crate::prefetcher::{PrefetchBuffer, UrlPrefetcher};
use crossbeam_queue::SegQueue;
use haul_kernel::{AgentError, PartDescriptor, RetryConfig};
use haul_store::StateStore;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

const URL_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Multi-producer/multi-consumer queue of part descriptors still needing an
/// upload attempt. Lock-free (§5 permits either).
pub struct WorkQueue {
    queue: SegQueue<PartDescriptor>,
}

impl WorkQueue {
    pub fn new(parts: impl IntoIterator<Item = PartDescriptor>) -> Arc<Self> {
        let queue = SegQueue::new();
        for part in parts {
            queue.push(part);
        }
        Arc::new(Self { queue })
    }

    pub fn push(&self, part: PartDescriptor) {
        self.queue.push(part);
    }

    pub fn pop(&self) -> Option<PartDescriptor> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Shared pause condition: blocks new dispatches without killing in-flight
/// PUTs (§9 "pause as a gate, not a kill").
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { paused: AtomicBool::new(false), notify: Notify::new() })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn wait_while_paused(&self, cancel: &CancellationToken) {
        while self.is_paused() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// A worker-observed outcome, published for the Control Surface to turn into
/// `chunk` wire frames.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Uploading { part_number: u32 },
    Completed { part_number: u32, etag: String },
    Failed { part_number: u32 },
}

/// Everything a worker needs that's shared across the pool, bundled so
/// `spawn_workers` doesn't take a dozen positional arguments.
pub struct WorkerPool {
    pub queue: Arc<WorkQueue>,
    pub prefetch: Arc<PrefetchBuffer>,
    pub prefetcher: Arc<UrlPrefetcher>,
    pub file_reader: FileReader,
    pub store: StateStore,
    pub http: reqwest::Client,
    pub upload_id: String,
    pub retry: RetryConfig,
    pub max_global_retries: u32,
    pub http_timeout: Duration,
    pub pause_gate: Arc<PauseGate>,
    pub cancel: CancellationToken,
    pub events_tx: mpsc::UnboundedSender<WorkerEvent>,
    pub bytes_transferred: Arc<AtomicU64>,
    pub active_workers: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `worker_count` worker tasks and returns their join handles.
    /// Each worker runs until the queue is empty or cancellation fires.
    pub fn spawn(self: Arc<Self>, worker_count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count)
            .map(|worker_index| {
                let pool = self.clone();
                tokio::spawn(
                    async move { pool.run_worker(worker_index).await }
                        .instrument(info_span!("worker", index = worker_index)),
                )
            })
            .collect()
    }

    async fn run_worker(&self, worker_index: usize) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            self.pause_gate.wait_while_paused(&self.cancel).await;
            if self.cancel.is_cancelled() {
                return;
            }

            let Some(part) = self.queue.pop() else {
                return;
            };

            let part_number = part.part_number;
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            let outcome = self.upload_part(part).await;
            self.active_workers.fetch_sub(1, Ordering::SeqCst);

            if let Err(err) = outcome {
                warn!(worker = worker_index, part_number, %err, "part upload failed");
                // A state-store write failure is fatal for this worker (§7):
                // its view of part state can no longer be trusted, so it
                // stops dispatching rather than risk a duplicate upload.
                if matches!(err, AgentError::StateStore { .. }) {
                    return;
                }
            }
        }
    }

    async fn upload_part(&self, part: PartDescriptor) -> haul_kernel::Result<()> {
        // A state-store write failure is fatal for this part's attempt (§7):
        // propagate rather than silently proceed with an un-persisted status.
        self.store.mark_uploading(&self.upload_id, part.part_number).await?;
        let _ = self.events_tx.send(WorkerEvent::Uploading { part_number: part.part_number });

        let Some(entry) = self
            .prefetch
            .take_for_part(part.part_number, URL_RESOLUTION_TIMEOUT)
            .await
        else {
            self.prefetcher.request(part.part_number);
            let err = AgentError::UploadError {
                message: format!("no presigned URL for part {} within time budget", part.part_number),
            };
            self.fail_and_maybe_requeue(part, &err).await;
            return Err(err);
        };

        let bytes = self.file_reader.read_at(part.byte_offset, part.byte_length).await?;

        match self.put_with_retry(&entry.url, bytes).await {
            Ok(etag) => {
                self.store.mark_completed(&self.upload_id, part.part_number, etag.clone()).await?;
                self.bytes_transferred.fetch_add(part.byte_length, Ordering::SeqCst);
                let _ = self
                    .events_tx
                    .send(WorkerEvent::Completed { part_number: part.part_number, etag });
                Ok(())
            }
            Err(err) => {
                self.fail_and_maybe_requeue(part, &err).await;
                Err(err)
            }
        }
    }

    /// Re-pushes `part` onto the queue only when both the state store still
    /// has retry budget left and `err` is transient (§4.6 step 7, §7): a
    /// permanent HTTP 4xx (e.g. 403/404) is marked failed once and never
    /// dispatched again, no matter how many global retries remain.
    async fn fail_and_maybe_requeue(&self, part: PartDescriptor, err: &AgentError) {
        match self.store.mark_failed(&self.upload_id, part.part_number).await {
            Ok(retry_count) if retry_count < self.max_global_retries && err.is_transient() => {
                self.queue.push(part);
            }
            _ => {
                let _ = self.events_tx.send(WorkerEvent::Failed { part_number: part.part_number });
            }
        }
    }

    /// Streams `bytes` to `url`, retrying transient failures inline with
    /// exponential backoff up to `retry.max_attempts`. A missing `ETag` is
    /// treated as a retriable failure, never a fabricated receipt (§9 open
    /// question).
    async fn put_with_retry(&self, url: &str, bytes: Vec<u8>) -> haul_kernel::Result<String> {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            match self.put_once(url, bytes.clone()).await {
                Ok(etag) => return Ok(etag),
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%err, attempt, delay_ms = delay.as_millis() as u64, "transient PUT failure, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_once(&self, url: &str, bytes: Vec<u8>) -> haul_kernel::Result<String> {
        haul_kernel::http::log_request("PUT", url);
        let started = std::time::Instant::now();
        let response = self
            .http
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .timeout(self.http_timeout)
            .body(bytes)
            .send()
            .await
            .map_err(|e| AgentError::Network { message: e.to_string(), source: Some(e) })?;
        haul_kernel::http::log_response(response.status().as_u16(), url, started.elapsed());

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Api { status, message });
        }

        match response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
        {
            Some(etag) => Ok(etag),
            None => Err(AgentError::Network {
                message: "storage response omitted an ETag header".to_string(),
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_kernel::{HttpClient, HttpClientConfig, PartRow, PartStatus};
    use haul_store::StateStore;

    async fn test_pool() -> (Arc<WorkerPool>, tempfile::TempDir, mpsc::UnboundedReceiver<WorkerEvent>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("db")).await.expect("open store");
        store
            .create_upload(haul_kernel::UploadJob {
                upload_id: "up-1".into(),
                file_path: "/tmp/whatever".into(),
                file_name: "whatever".into(),
                file_size: 10,
                fingerprint: "10:0".into(),
                bucket: "b".into(),
                object_key: "k".into(),
                part_size: 10,
                total_parts: 1,
                status: haul_kernel::JobStatus::InProgress,
                created_at: chrono::Utc::now(),
                completed_at: None,
            })
            .await
            .expect("create upload");
        store
            .init_parts(vec![PartRow {
                upload_id: "up-1".into(),
                part_number: 1,
                byte_offset: 0,
                byte_length: 10,
                etag: None,
                status: PartStatus::Pending,
                retry_count: 0,
            }])
            .await
            .expect("init parts");

        let file_path = dir.path().join("source");
        std::fs::write(&file_path, vec![0u8; 10]).expect("write source file");
        let file_reader = FileReader::lock(&file_path).expect("lock file");

        let http = HttpClient::new(HttpClientConfig::default()).expect("http client");
        let coordinator = Arc::new(crate::coordinator::CoordinatorClient::new(
            http,
            "http://127.0.0.1:0".to_string(),
        ));
        let prefetch = PrefetchBuffer::new(10);
        let cancel = CancellationToken::new();
        let prefetcher = Arc::new(UrlPrefetcher::spawn(
            coordinator,
            "up-1".to_string(),
            "b".to_string(),
            "k".to_string(),
            prefetch.clone(),
            std::collections::VecDeque::new(),
            20,
            cancel.clone(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool {
            queue: WorkQueue::new(std::iter::empty()),
            prefetch,
            prefetcher,
            file_reader,
            store,
            http: reqwest::Client::new(),
            upload_id: "up-1".to_string(),
            retry: RetryConfig::default(),
            max_global_retries: 5,
            http_timeout: Duration::from_secs(30),
            pause_gate: PauseGate::new(),
            cancel,
            events_tx,
            bytes_transferred: Arc::new(AtomicU64::new(0)),
            active_workers: Arc::new(AtomicUsize::new(0)),
        });

        (pool, dir, events_rx)
    }

    #[tokio::test]
    async fn fail_and_maybe_requeue_requeues_a_transient_failure() {
        let (pool, _dir, _events_rx) = test_pool().await;
        let part = PartDescriptor { part_number: 1, byte_offset: 0, byte_length: 10 };
        let err = AgentError::Api { status: 503, message: "slow down".into() };

        pool.fail_and_maybe_requeue(part, &err).await;

        assert_eq!(pool.queue.len(), 1);
        assert_eq!(pool.queue.pop().unwrap().part_number, 1);
    }

    #[tokio::test]
    async fn fail_and_maybe_requeue_does_not_requeue_a_permanent_failure() {
        let (pool, _dir, mut events_rx) = test_pool().await;
        let part = PartDescriptor { part_number: 1, byte_offset: 0, byte_length: 10 };
        let err = AgentError::Api { status: 403, message: "forbidden".into() };

        pool.fail_and_maybe_requeue(part, &err).await;

        assert!(pool.queue.is_empty());
        match events_rx.recv().await {
            Some(WorkerEvent::Failed { part_number }) => assert_eq!(part_number, 1),
            other => panic!("expected a Failed event, got {other:?}"),
        }
    }

    #[test]
    fn work_queue_drains_fifo_ish_and_reports_empty() {
        let parts = vec![
            PartDescriptor { part_number: 1, byte_offset: 0, byte_length: 10 },
            PartDescriptor { part_number: 2, byte_offset: 10, byte_length: 10 },
        ];
        let queue = WorkQueue::new(parts);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = PauseGate::new();
        gate.pause();
        assert!(gate.is_paused());

        let cancel = CancellationToken::new();
        let gate_clone = gate.clone();
        let cancel_clone = cancel.clone();
        let waiter = tokio::spawn(async move {
            gate_clone.wait_while_paused(&cancel_clone).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resume unblocks waiter")
            .expect("no panic");
    }
}
