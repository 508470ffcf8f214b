//! URL Prefetcher: a single producer, many-consumer pipeline that keeps a
//! bounded buffer of presigned URLs topped up ahead of the Worker Pool (§4.5).

use crate::coordinator::{CoordinatorClient, PresignedUrlEntry};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PRESIGN_RETRY_DELAY: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded buffer of `{part_number, url, expires_at}` entries, backpressured
/// by `presign_lookahead`. Consumers look up entries by `part_number`
/// (matching the Worker Pool's "resolve URL" step); unrelated entries stay
/// in the buffer, expired ones are dropped on sight.
pub struct PrefetchBuffer {
    inner: Mutex<VecDeque<PresignedUrlEntry>>,
    capacity: usize,
    not_empty: Notify,
}

impl PrefetchBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            not_empty: Notify::new(),
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a freshly presigned batch and wakes anyone waiting on it.
    pub async fn extend(&self, entries: Vec<PresignedUrlEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().await;
        guard.extend(entries);
        drop(guard);
        self.not_empty.notify_waiters();
    }

    /// Polls for an entry matching `part_number`, purging expired entries as
    /// it scans. Returns `None` after `timeout` elapses without a match
    /// (the Worker Pool then marks the part failed for this pass, §4.6 step 3).
    pub async fn take_for_part(
        &self,
        part_number: u32,
        timeout: Duration,
    ) -> Option<PresignedUrlEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut guard = self.inner.lock().await;
                let now = chrono::Utc::now();
                guard.retain(|e| e.expires_at > now);
                if let Some(pos) = guard.iter().position(|e| e.part_number == part_number) {
                    return guard.remove(pos);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

/// Single-producer driver that keeps [`PrefetchBuffer`] topped up to
/// `presign_lookahead`, requesting `presign_batch_size` part numbers per
/// round from the [`CoordinatorClient`]. Workers can ask for a part's URL to
/// be re-presigned (expired/mismatched entry) via [`UrlPrefetcher::request`].
pub struct UrlPrefetcher {
    request_tx: mpsc::UnboundedSender<u32>,
}

impl UrlPrefetcher {
    /// Starts the producer loop as a background task; returns a handle used
    /// to request re-presigning of specific parts mid-upload.
    pub fn spawn(
        coordinator: Arc<CoordinatorClient>,
        upload_id: String,
        bucket: String,
        object_key: String,
        buffer: Arc<PrefetchBuffer>,
        mut pending: VecDeque<u32>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<u32>();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                while let Ok(part_number) = request_rx.try_recv() {
                    if !pending.contains(&part_number) {
                        pending.push_back(part_number);
                    }
                }

                let lookahead = buffer.capacity();
                if buffer.len().await >= lookahead {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => return,
                    }
                    continue;
                }

                let take_n = batch_size.min(pending.len());
                if take_n == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => return,
                    }
                    continue;
                }

                let batch: Vec<u32> = (0..take_n).filter_map(|_| pending.pop_front()).collect();
                match coordinator.presign(&upload_id, &bucket, &object_key, &batch).await {
                    Ok(entries) => {
                        debug!(count = entries.len(), "presigned batch");
                        buffer.extend(entries).await;
                    }
                    Err(err) => {
                        warn!(%err, "presign batch failed, retrying shortly");
                        for part_number in batch.into_iter().rev() {
                            pending.push_front(part_number);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(PRESIGN_RETRY_DELAY) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            }
        });

        Self { request_tx }
    }

    /// Requests a fresh presigned URL for a part whose buffered entry
    /// expired or didn't match (worker-driven re-enqueue).
    pub fn request(&self, part_number: u32) {
        let _ = self.request_tx.send(part_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn entry(part_number: u32, expires_in_secs: i64) -> PresignedUrlEntry {
        PresignedUrlEntry {
            part_number,
            url: format!("https://s3/part-{part_number}"),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
        }
    }

    #[tokio::test]
    async fn take_for_part_finds_match_and_leaves_others() {
        let buffer = PrefetchBuffer::new(10);
        buffer.extend(vec![entry(1, 60), entry(2, 60), entry(3, 60)]).await;

        let found = buffer.take_for_part(2, Duration::from_millis(50)).await;
        assert_eq!(found.unwrap().part_number, 2);
        assert_eq!(buffer.len().await, 2);
    }

    #[tokio::test]
    async fn take_for_part_times_out_when_absent() {
        let buffer = PrefetchBuffer::new(10);
        buffer.extend(vec![entry(1, 60)]).await;
        let found = buffer.take_for_part(99, Duration::from_millis(100)).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn take_for_part_discards_expired_entries() {
        let buffer = PrefetchBuffer::new(10);
        buffer.extend(vec![entry(1, -5)]).await;
        let found = buffer.take_for_part(1, Duration::from_millis(100)).await;
        assert!(found.is_none());
        assert_eq!(buffer.len().await, 0);
    }
}
