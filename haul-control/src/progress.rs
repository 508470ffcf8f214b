//! Progress ticker: broadcasts a `progress` frame every `progress_interval`
//! while a job is active (§4.7). Speed is a simple cumulative mean; a
//! windowed estimate is spec-permitted but not required (§9 open question).

use crate::events::OutboundFrame;
use crate::server::ControlSurface;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Shared counters the Worker Pool and Supervisor update in place; the
/// ticker only reads them. `bytes_transferred` and `active_workers` are the
/// same `Arc`s handed to the worker pool, so updates are visible immediately.
pub struct ProgressSource {
    pub bytes_transferred: Arc<AtomicU64>,
    pub active_workers: Arc<AtomicUsize>,
    total_bytes: AtomicU64,
    completed_parts: AtomicU32,
    total_parts: AtomicU32,
    upload_id: Mutex<Option<String>>,
    started_at: Mutex<Option<Instant>>,
}

impl ProgressSource {
    pub fn new(bytes_transferred: Arc<AtomicU64>, active_workers: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            bytes_transferred,
            active_workers,
            total_bytes: AtomicU64::new(0),
            completed_parts: AtomicU32::new(0),
            total_parts: AtomicU32::new(0),
            upload_id: Mutex::new(None),
            started_at: Mutex::new(None),
        })
    }

    pub fn start_job(&self, upload_id: String, total_bytes: u64, total_parts: u32) {
        *self.upload_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(upload_id);
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
        self.total_parts.store(total_parts, Ordering::SeqCst);
        self.completed_parts.store(0, Ordering::SeqCst);
        self.bytes_transferred.store(0, Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn set_completed_parts(&self, n: u32) {
        self.completed_parts.store(n, Ordering::SeqCst);
    }

    pub fn stop_job(&self) {
        *self.upload_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Builds a `progress` frame from the current counters, or `None` if no
    /// job is active.
    pub fn snapshot(&self) -> Option<JobSnapshot> {
        let upload_id = self.upload_id.lock().unwrap_or_else(|e| e.into_inner()).clone()?;
        let started_at = (*self.started_at.lock().unwrap_or_else(|e| e.into_inner()))?;

        let bytes_transferred = self.bytes_transferred.load(Ordering::SeqCst);
        let total_bytes = self.total_bytes.load(Ordering::SeqCst);
        let elapsed = started_at.elapsed().as_secs_f64();

        let speed = if elapsed > 0.0 { bytes_transferred as f64 / elapsed } else { 0.0 };
        let percent = if total_bytes > 0 {
            100.0 * bytes_transferred as f64 / total_bytes as f64
        } else {
            0.0
        };
        let eta = if speed > 0.0 {
            (total_bytes.saturating_sub(bytes_transferred)) as f64 / speed
        } else {
            0.0
        };

        Some(JobSnapshot {
            upload_id,
            percent,
            speed,
            eta,
            bytes_transferred,
            total_bytes,
            active_threads: self.active_workers.load(Ordering::SeqCst),
            completed_parts: self.completed_parts.load(Ordering::SeqCst),
            total_parts: self.total_parts.load(Ordering::SeqCst),
        })
    }
}

/// A computed snapshot, used both for the periodic `progress` frame and to
/// catch up a client that attaches mid-job (§4.7 expansion).
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub upload_id: String,
    pub percent: f64,
    pub speed: f64,
    pub eta: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub active_threads: usize,
    pub completed_parts: u32,
    pub total_parts: u32,
}

impl From<JobSnapshot> for OutboundFrame {
    fn from(s: JobSnapshot) -> Self {
        OutboundFrame::Progress {
            upload_id: s.upload_id,
            percent: s.percent,
            speed: s.speed,
            eta: s.eta,
            bytes_transferred: s.bytes_transferred,
            total_bytes: s.total_bytes,
            active_threads: s.active_threads,
            completed_parts: s.completed_parts,
            total_parts: s.total_parts,
        }
    }
}

pub struct ProgressTicker;

impl ProgressTicker {
    /// Spawns the periodic ticker; stops cleanly on cancellation (it never
    /// tears down the surface itself — §9).
    pub fn spawn(
        surface: Arc<ControlSurface>,
        source: Arc<ProgressSource>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(snapshot) = source.snapshot() {
                            surface.publish_snapshot(snapshot.clone());
                            surface.broadcast(OutboundFrame::from(snapshot));
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_none_before_a_job_starts() {
        let source = ProgressSource::new(
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        assert!(source.snapshot().is_none());
    }

    #[test]
    fn snapshot_computes_percent_and_zero_eta_at_zero_speed() {
        let source = ProgressSource::new(
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        source.start_job("up-1".into(), 1000, 10);
        let snapshot = source.snapshot().expect("job is active");
        assert_eq!(snapshot.upload_id, "up-1");
        assert_eq!(snapshot.percent, 0.0);
        assert_eq!(snapshot.eta, 0.0);
    }

    #[test]
    fn stop_job_clears_snapshot() {
        let source = ProgressSource::new(
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        source.start_job("up-1".into(), 1000, 10);
        source.stop_job();
        assert!(source.snapshot().is_none());
    }
}
