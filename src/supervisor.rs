//! Job Supervisor: the single-job lifecycle controller (§4.8).
//!
//! The only component allowed to change a job's status. Binds the File
//! Reader, Coordinator Client, State Store, URL Prefetcher, Worker Pool, and
//! Control Surface together for exactly one active upload at a time,
//! validating commands and driving the phase transitions
//! `preparing -> uploading -> finalizing -> {completed, failed}`, with
//! `paused` and `cancelled` reachable from `uploading` (§4.8).

use haul_control::{Command, ControlSurface, OutboundFrame, ProgressSource, ProgressTicker};
use haul_kernel::{AgentError, Config, Fingerprint, JobStatus, PartDescriptor, PartRow, PartStatus, Result};
use haul_store::StateStore;
use haul_transfer::{
    auto_size_part, slice, AbortRequest, CompletePart, CompleteRequest, CoordinatorClient,
    FileReader, InitiateRequest, PauseGate, PrefetchBuffer, UrlPrefetcher, WorkQueue, WorkerEvent,
    WorkerPool,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The job currently bound to this supervisor, if any. Holds everything a
/// pause/resume/cancel command needs without re-deriving it from the store.
struct ActiveJob {
    upload_id: String,
    bucket: String,
    object_key: String,
    cancel: CancellationToken,
    pause_gate: Arc<PauseGate>,
    coordinator: Arc<CoordinatorClient>,
}

enum Phase {
    Idle,
    Active(ActiveJob),
}

/// Lifecycle glue binding one active job's components together. Cheap to
/// share via `Arc`; every command handler takes `self: Arc<Self>` so it can
/// spawn the background uploading task without the caller having to manage
/// a separate handle.
pub struct Supervisor {
    config: Config,
    store: StateStore,
    surface: Arc<ControlSurface>,
    default_coordinator: Arc<CoordinatorClient>,
    phase: Mutex<Phase>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: StateStore,
        default_coordinator: Arc<CoordinatorClient>,
        surface: Arc<ControlSurface>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            surface,
            default_coordinator,
            phase: Mutex::new(Phase::Idle),
        })
    }

    /// Drains inbound commands until the channel closes (which only happens
    /// if the Control Surface itself is dropped — in practice, forever).
    /// Resumes any job left `in-progress`/`paused` by a prior crash before
    /// processing the first command (§4.8 "Startup resume").
    pub async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.clone().resume_on_startup().await;

        while let Some(command) = commands.recv().await {
            match command {
                Command::Start { file_path, upload_id: _, backend_url } => {
                    self.clone().handle_start(file_path, backend_url).await;
                }
                Command::Pause => self.handle_pause().await,
                Command::Resume => self.handle_resume().await,
                Command::Cancel => self.clone().handle_cancel().await,
            }
        }
    }

    async fn resume_on_startup(self: Arc<Self>) {
        let job = match self.store.find_resumable_job().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                error!(%err, "failed to query for a resumable job at startup");
                return;
            }
        };

        info!(upload_id = %job.upload_id, "resuming job left active by a prior process");

        let file_reader = match FileReader::lock(&job.file_path) {
            Ok(reader) => reader,
            Err(err) => {
                self.fail_unresumable(&job.upload_id, &err).await;
                return;
            }
        };

        match file_reader.fingerprint() {
            Ok(fp) if fp.as_str() == job.fingerprint => {}
            Ok(_) => {
                file_reader.release();
                self.fail_unresumable(&job.upload_id, &AgentError::FingerprintMismatch).await;
                return;
            }
            Err(err) => {
                file_reader.release();
                self.fail_unresumable(&job.upload_id, &err).await;
                return;
            }
        }

        self.surface.publish_status(
            Some(job.upload_id.clone()),
            "uploading",
            "resuming upload after restart",
        );
        self.spawn_uploading(job, file_reader, self.default_coordinator.clone()).await;
    }

    /// A job that cannot be resumed (lock or fingerprint failure) is marked
    /// `failed` rather than left dangling `in-progress` forever (§4.8, §7).
    async fn fail_unresumable(&self, upload_id: &str, err: &AgentError) {
        warn!(%upload_id, %err, "resumable job failed re-validation");
        if let Err(store_err) = self.store.update_job_status(upload_id, JobStatus::Failed).await {
            error!(%store_err, "failed to mark unresumable job as failed");
        }
        self.surface.publish_error(Some(upload_id.to_string()), err);
        self.surface.publish_status(Some(upload_id.to_string()), "failed", &err.to_string());
    }

    async fn handle_start(self: Arc<Self>, file_path: Option<String>, backend_url: Option<String>) {
        {
            let phase = self.phase.lock().await;
            if matches!(&*phase, Phase::Active(_)) {
                self.surface.publish_error(None, &AgentError::UploadInProgress);
                return;
            }
        }

        let Some(file_path) = file_path else {
            let err = AgentError::UploadError { message: "start requires a filePath".into() };
            self.surface.publish_error(None, &err);
            return;
        };

        self.surface.publish_status(None, "preparing", &format!("preparing {file_path}"));

        let coordinator = match &backend_url {
            Some(url) => match self.coordinator_for(url.clone()) {
                Ok(c) => Arc::new(c),
                Err(err) => {
                    self.surface.publish_error(None, &err);
                    self.surface.publish_status(None, "failed", &err.to_string());
                    return;
                }
            },
            None => self.default_coordinator.clone(),
        };

        match self.prepare(&file_path, &coordinator).await {
            Ok((job, file_reader)) => {
                self.surface.publish_status(
                    Some(job.upload_id.clone()),
                    "uploading",
                    "upload started",
                );
                self.spawn_uploading(job, file_reader, coordinator).await;
            }
            Err(err) => {
                self.surface.publish_error(None, &err);
                self.surface.publish_status(None, "failed", &err.to_string());
            }
        }
    }

    fn coordinator_for(&self, backend_url: String) -> Result<CoordinatorClient> {
        let http = haul_kernel::HttpClient::new(haul_kernel::HttpClientConfig {
            timeout: self.config.http_timeout,
            ..haul_kernel::HttpClientConfig::default()
        })
        .map_err(|e| AgentError::Internal { message: format!("failed to build http client: {e}") })?;
        Ok(CoordinatorClient::new(http, backend_url))
    }

    /// idle -> preparing -> uploading (§4.8): lock the file, fingerprint it,
    /// auto-size the part, call `initiate`, then persist the job and its
    /// part rows in one atomic batch. Any failure releases the file and
    /// surfaces before returning to idle — never partially acquired.
    async fn prepare(
        &self,
        file_path: &str,
        coordinator: &CoordinatorClient,
    ) -> Result<(haul_kernel::UploadJob, FileReader)> {
        let file_reader = FileReader::lock(file_path)?;

        match self.prepare_with_lock(file_path, coordinator, &file_reader).await {
            Ok(job) => Ok((job, file_reader)),
            Err(err) => {
                file_reader.release();
                Err(err)
            }
        }
    }

    async fn prepare_with_lock(
        &self,
        file_path: &str,
        coordinator: &CoordinatorClient,
        file_reader: &FileReader,
    ) -> Result<haul_kernel::UploadJob> {
        let fingerprint: Fingerprint = file_reader.fingerprint()?;
        let file_size = file_reader.file_size()?;

        // Local feasibility check before ever contacting the coordinator
        // (spec §8 scenario D: a file so large no part size within bounds
        // can keep total_parts under max_parts fails fast).
        auto_size_part(file_size, &self.config)?;

        let file_name = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string());

        let initiate_response = coordinator
            .initiate(&InitiateRequest {
                file_name: file_name.clone(),
                file_size,
                file_fingerprint: fingerprint.to_string(),
                content_type: "application/octet-stream".to_string(),
            })
            .await
            .map_err(|e| AgentError::InitiateFailed { message: e.to_string() })?;

        // The coordinator has the final say on chunk size (it may have its
        // own storage-engine bounds); slice against *its* answer.
        let parts = slice(file_size, initiate_response.chunk_size);
        if parts.len() as u32 != initiate_response.total_parts {
            return Err(AgentError::InitiateFailed {
                message: format!(
                    "coordinator reported {} parts but slicing at chunk_size={} yields {}",
                    initiate_response.total_parts,
                    initiate_response.chunk_size,
                    parts.len()
                ),
            });
        }

        let job = haul_kernel::UploadJob {
            upload_id: initiate_response.upload_id.clone(),
            file_path: file_path.to_string(),
            file_name,
            file_size,
            fingerprint: fingerprint.to_string(),
            bucket: initiate_response.bucket,
            object_key: initiate_response.object_key,
            part_size: initiate_response.chunk_size,
            total_parts: initiate_response.total_parts,
            status: JobStatus::InProgress,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };

        self.store.create_upload(job.clone()).await?;
        let rows: Vec<PartRow> = parts
            .iter()
            .map(|p| PartRow {
                upload_id: job.upload_id.clone(),
                part_number: p.part_number,
                byte_offset: p.byte_offset,
                byte_length: p.byte_length,
                etag: None,
                status: PartStatus::Pending,
                retry_count: 0,
            })
            .collect();
        self.store.init_parts(rows).await?;

        Ok(job)
    }

    /// Starts (or resumes) the `uploading` phase for an already-persisted
    /// job: populates the work queue from `get_pending`, spawns the URL
    /// prefetcher, the worker pool, and the progress ticker, then drives the
    /// phase to `finalizing` once every part is observed `completed`.
    async fn spawn_uploading(
        self: Arc<Self>,
        job: haul_kernel::UploadJob,
        file_reader: FileReader,
        coordinator: Arc<CoordinatorClient>,
    ) {
        let cancel = CancellationToken::new();
        let pause_gate = PauseGate::new();

        {
            let mut phase = self.phase.lock().await;
            *phase = Phase::Active(ActiveJob {
                upload_id: job.upload_id.clone(),
                bucket: job.bucket.clone(),
                object_key: job.object_key.clone(),
                cancel: cancel.clone(),
                pause_gate: pause_gate.clone(),
                coordinator: coordinator.clone(),
            });
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.drive_uploading(job, file_reader, coordinator, cancel, pause_gate).await;
        });
    }

    async fn drive_uploading(
        self: Arc<Self>,
        job: haul_kernel::UploadJob,
        file_reader: FileReader,
        coordinator: Arc<CoordinatorClient>,
        cancel: CancellationToken,
        pause_gate: Arc<PauseGate>,
    ) {
        let upload_id = job.upload_id.clone();

        let pending_rows = match self.store.get_pending(&upload_id, self.config.retry_max_attempts).await {
            Ok(rows) => rows,
            Err(err) => {
                self.fail_job(&job, &file_reader, &err).await;
                return;
            }
        };
        let pending_numbers: VecDeque<u32> = pending_rows.iter().map(|r| r.part_number).collect();
        let descriptors: Vec<PartDescriptor> = pending_rows
            .iter()
            .map(|r| PartDescriptor {
                part_number: r.part_number,
                byte_offset: r.byte_offset,
                byte_length: r.byte_length,
            })
            .collect();

        let queue = WorkQueue::new(descriptors);
        let prefetch = PrefetchBuffer::new(self.config.presign_lookahead);
        let prefetcher = Arc::new(UrlPrefetcher::spawn(
            coordinator.clone(),
            upload_id.clone(),
            job.bucket.clone(),
            job.object_key.clone(),
            prefetch.clone(),
            pending_numbers,
            self.config.presign_batch_size,
            cancel.clone(),
        ));

        let http = match reqwest::Client::builder()
            .user_agent(concat!("haul/", env!("CARGO_PKG_VERSION")))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                self.fail_job(
                    &job,
                    &file_reader,
                    &AgentError::Internal { message: format!("failed to build storage http client: {err}") },
                )
                .await;
                return;
            }
        };

        let bytes_transferred = Arc::new(AtomicU64::new(0));
        let active_workers = Arc::new(AtomicUsize::new(0));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WorkerEvent>();

        let pool = Arc::new(WorkerPool {
            queue,
            prefetch,
            prefetcher,
            file_reader: file_reader.clone(),
            store: self.store.clone(),
            http,
            upload_id: upload_id.clone(),
            retry: haul_kernel::RetryConfig {
                max_attempts: self.config.retry_max_attempts,
                base_delay: self.config.retry_base_delay,
                max_delay: self.config.retry_max_delay,
                jitter: true,
            },
            max_global_retries: self.config.retry_max_attempts,
            http_timeout: self.config.http_timeout,
            pause_gate: pause_gate.clone(),
            cancel: cancel.clone(),
            events_tx,
            bytes_transferred: bytes_transferred.clone(),
            active_workers: active_workers.clone(),
        });

        let progress_source = ProgressSource::new(bytes_transferred, active_workers);
        progress_source.start_job(upload_id.clone(), job.file_size, job.total_parts);
        let ticker = ProgressTicker::spawn(
            self.surface.clone(),
            progress_source.clone(),
            self.config.progress_interval,
            cancel.clone(),
        );

        let surface = self.surface.clone();
        let events_upload_id = upload_id.clone();
        let progress_for_events = progress_source.clone();
        let mut initial_completed = 0u32;
        if let Ok(completed) = self.store.count_completed(&upload_id).await {
            initial_completed = completed;
        }
        progress_source.set_completed_parts(initial_completed);
        let events_task = tokio::spawn(async move {
            let mut completed = initial_completed;
            while let Some(event) = events_rx.recv().await {
                match event {
                    WorkerEvent::Uploading { part_number } => {
                        surface.broadcast(OutboundFrame::Chunk {
                            upload_id: events_upload_id.clone(),
                            part_number,
                            status: "uploading".to_string(),
                            etag: None,
                        });
                    }
                    WorkerEvent::Completed { part_number, etag } => {
                        completed += 1;
                        progress_for_events.set_completed_parts(completed);
                        surface.broadcast(OutboundFrame::Chunk {
                            upload_id: events_upload_id.clone(),
                            part_number,
                            status: "completed".to_string(),
                            etag: Some(etag),
                        });
                    }
                    WorkerEvent::Failed { part_number } => {
                        surface.broadcast(OutboundFrame::Chunk {
                            upload_id: events_upload_id.clone(),
                            part_number,
                            status: "failed".to_string(),
                            etag: None,
                        });
                    }
                }
            }
        });

        let worker_count = self.config.effective_workers(job.part_size);
        let handles = pool.clone().spawn(worker_count);
        for handle in handles {
            let _ = handle.await;
        }
        // Dropping the pool drops its last `events_tx`, letting `events_task`
        // observe channel closure and return.
        drop(pool);
        let _ = events_task.await;
        ticker.abort();

        if cancel.is_cancelled() {
            // `handle_cancel` already updated the store, surface, and phase.
            return;
        }

        self.finalize(&job, &file_reader, &coordinator).await;
    }

    /// uploading -> finalizing -> {completed, failed} (§4.8): waits for every
    /// part to be observed `completed` in the store, then calls the
    /// coordinator's `complete` with the ordered receipt list.
    async fn finalize(
        &self,
        job: &haul_kernel::UploadJob,
        file_reader: &FileReader,
        coordinator: &CoordinatorClient,
    ) {
        let upload_id = &job.upload_id;

        let completed_count = match self.store.count_completed(upload_id).await {
            Ok(n) => n,
            Err(err) => {
                self.fail_job(job, file_reader, &err).await;
                return;
            }
        };

        if completed_count != job.total_parts {
            let err = AgentError::Incomplete { completed: completed_count, total: job.total_parts };
            self.fail_job(job, file_reader, &err).await;
            return;
        }

        self.surface.publish_status(Some(upload_id.clone()), "verifying", "finalizing upload");

        let mut ordered = match self.store.get_completed(upload_id).await {
            Ok(rows) => rows,
            Err(err) => {
                self.fail_job(job, file_reader, &err).await;
                return;
            }
        };
        ordered.sort_by_key(|(part_number, _)| *part_number);

        let request = CompleteRequest {
            upload_id: upload_id.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
            parts: ordered
                .into_iter()
                .map(|(part_number, etag)| CompletePart { part_number, etag })
                .collect(),
        };

        match coordinator.complete(&request).await {
            Ok(response) if response.status == "completed" => {
                if let Err(err) = self.store.update_job_status(upload_id, JobStatus::Completed).await {
                    error!(%err, "failed to persist completed status");
                }
                self.surface.publish_status(Some(upload_id.clone()), "completed", "upload complete");
                file_reader.clone().release();
                self.to_idle(upload_id).await;
            }
            Ok(response) => {
                let err = AgentError::UploadError {
                    message: format!("coordinator did not accept the upload: {}", response.status),
                };
                self.best_effort_abort(job, coordinator).await;
                self.fail_job(job, file_reader, &err).await;
            }
            Err(err) => {
                let err = AgentError::UploadError { message: err.to_string() };
                self.best_effort_abort(job, coordinator).await;
                self.fail_job(job, file_reader, &err).await;
            }
        }
    }

    async fn best_effort_abort(&self, job: &haul_kernel::UploadJob, coordinator: &CoordinatorClient) {
        let request = AbortRequest {
            upload_id: job.upload_id.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
        };
        if let Err(err) = coordinator.abort(&request).await {
            warn!(%err, upload_id = %job.upload_id, "best-effort abort after complete failure also failed");
        }
    }

    async fn fail_job(&self, job: &haul_kernel::UploadJob, file_reader: &FileReader, err: &AgentError) {
        if let Err(store_err) = self.store.update_job_status(&job.upload_id, JobStatus::Failed).await {
            error!(%store_err, "failed to persist failed status");
        }
        self.surface.publish_error(Some(job.upload_id.clone()), err);
        self.surface.publish_status(Some(job.upload_id.clone()), "failed", &err.to_string());
        file_reader.clone().release();
        self.to_idle(&job.upload_id).await;
    }

    /// Clears the active-job slot, but only if it's still this job's — a
    /// concurrent `cancel` may already have reset it (§9).
    async fn to_idle(&self, upload_id: &str) {
        let mut phase = self.phase.lock().await;
        if matches!(&*phase, Phase::Active(active) if active.upload_id == upload_id) {
            *phase = Phase::Idle;
        }
        self.surface.clear_job_state();
    }

    async fn handle_pause(&self) {
        let phase = self.phase.lock().await;
        let Phase::Active(active) = &*phase else {
            return;
        };
        active.pause_gate.pause();
        let upload_id = active.upload_id.clone();
        drop(phase);

        if let Err(err) = self.store.update_job_status(&upload_id, JobStatus::Paused).await {
            error!(%err, "failed to persist paused status");
        }
        self.surface.publish_status(Some(upload_id), "paused", "upload paused");
    }

    async fn handle_resume(&self) {
        let phase = self.phase.lock().await;
        let Phase::Active(active) = &*phase else {
            return;
        };
        active.pause_gate.resume();
        let upload_id = active.upload_id.clone();
        drop(phase);

        if let Err(err) = self.store.update_job_status(&upload_id, JobStatus::InProgress).await {
            error!(%err, "failed to persist resumed status");
        }
        self.surface.publish_status(Some(upload_id), "uploading", "upload resumed");
    }

    /// any -> cancelled (§4.8): cancels the worker/prefetch/ticker signal,
    /// attempts `abort` on the coordinator, updates the store, and clears
    /// the active-job slot immediately rather than waiting for the draining
    /// `drive_uploading` task to notice (§5, §9).
    async fn handle_cancel(self: Arc<Self>) {
        let (upload_id, bucket, object_key, coordinator) = {
            let phase = self.phase.lock().await;
            let Phase::Active(active) = &*phase else {
                return;
            };
            (
                active.upload_id.clone(),
                active.bucket.clone(),
                active.object_key.clone(),
                active.coordinator.clone(),
            )
        };

        {
            let phase = self.phase.lock().await;
            if let Phase::Active(active) = &*phase {
                active.cancel.cancel();
            }
        }

        if let Err(err) = coordinator
            .abort(&AbortRequest { upload_id: upload_id.clone(), bucket, object_key })
            .await
        {
            warn!(%err, %upload_id, "coordinator abort failed during cancel");
        }

        if let Err(err) = self.store.update_job_status(&upload_id, JobStatus::Cancelled).await {
            error!(%err, "failed to persist cancelled status");
        }

        {
            let mut phase = self.phase.lock().await;
            if matches!(&*phase, Phase::Active(active) if active.upload_id == upload_id) {
                *phase = Phase::Idle;
            }
        }

        self.surface.publish_status(Some(upload_id), "cancelled", "upload cancelled");
        self.surface.clear_job_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_kernel::{HttpClient, HttpClientConfig, PartStatus};
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("db")).await.expect("open store");
        (store, dir)
    }

    fn sample_job(upload_id: &str, file_path: &str, fingerprint: &str) -> haul_kernel::UploadJob {
        haul_kernel::UploadJob {
            upload_id: upload_id.to_string(),
            file_path: file_path.to_string(),
            file_name: "f".to_string(),
            file_size: 11,
            fingerprint: fingerprint.to_string(),
            bucket: "bucket".to_string(),
            object_key: "key".to_string(),
            part_size: 11,
            total_parts: 1,
            status: JobStatus::InProgress,
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    fn sample_parts(upload_id: &str) -> Vec<PartRow> {
        vec![PartRow {
            upload_id: upload_id.to_string(),
            part_number: 1,
            byte_offset: 0,
            byte_length: 11,
            etag: None,
            status: PartStatus::Pending,
            retry_count: 0,
        }]
    }

    fn test_supervisor(store: StateStore) -> Arc<Supervisor> {
        let config = Config::default();
        let http = HttpClient::new(HttpClientConfig::default()).expect("http client");
        let coordinator = Arc::new(CoordinatorClient::new(http, "http://127.0.0.1:0".to_string()));
        let (surface, _commands_rx) = ControlSurface::new(&config);
        Supervisor::new(config, store, coordinator, surface)
    }

    #[tokio::test]
    async fn pause_then_resume_updates_store_status_and_gate() {
        let (store, _dir) = test_store().await;
        store.create_upload(sample_job("job-1", "/tmp/f", "10:0")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();

        let supervisor = test_supervisor(store.clone());
        let pause_gate = PauseGate::new();
        {
            let mut phase = supervisor.phase.lock().await;
            *phase = Phase::Active(ActiveJob {
                upload_id: "job-1".to_string(),
                bucket: "bucket".to_string(),
                object_key: "key".to_string(),
                cancel: CancellationToken::new(),
                pause_gate: pause_gate.clone(),
                coordinator: supervisor.default_coordinator.clone(),
            });
        }

        supervisor.handle_pause().await;
        assert!(pause_gate.is_paused());
        assert_eq!(store.get_job("job-1").await.unwrap().unwrap().status, JobStatus::Paused);

        supervisor.handle_resume().await;
        assert!(!pause_gate.is_paused());
        assert_eq!(store.get_job("job-1").await.unwrap().unwrap().status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn cancel_aborts_on_coordinator_and_returns_to_idle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/abort"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (store, _dir) = test_store().await;
        store.create_upload(sample_job("job-1", "/tmp/f", "10:0")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();

        let supervisor = test_supervisor(store.clone());
        let http = HttpClient::new(HttpClientConfig::default()).expect("http client");
        let coordinator = Arc::new(CoordinatorClient::new(http, server.uri()));
        let cancel = CancellationToken::new();
        {
            let mut phase = supervisor.phase.lock().await;
            *phase = Phase::Active(ActiveJob {
                upload_id: "job-1".to_string(),
                bucket: "bucket".to_string(),
                object_key: "key".to_string(),
                cancel: cancel.clone(),
                pause_gate: PauseGate::new(),
                coordinator,
            });
        }

        supervisor.clone().handle_cancel().await;

        assert!(cancel.is_cancelled());
        assert_eq!(store.get_job("job-1").await.unwrap().unwrap().status, JobStatus::Cancelled);
        assert!(matches!(&*supervisor.phase.lock().await, Phase::Idle));
    }

    #[tokio::test]
    async fn start_is_rejected_while_a_job_is_active() {
        let (store, _dir) = test_store().await;
        store.create_upload(sample_job("job-1", "/tmp/f", "10:0")).await.unwrap();

        let supervisor = test_supervisor(store.clone());
        {
            let mut phase = supervisor.phase.lock().await;
            *phase = Phase::Active(ActiveJob {
                upload_id: "job-1".to_string(),
                bucket: "bucket".to_string(),
                object_key: "key".to_string(),
                cancel: CancellationToken::new(),
                pause_gate: PauseGate::new(),
                coordinator: supervisor.default_coordinator.clone(),
            });
        }

        supervisor.clone().handle_start(Some("/tmp/other".to_string()), None).await;

        // Still exactly the one job that was already active — nothing new was prepared.
        assert_eq!(store.find_resumable_job().await.unwrap().unwrap().upload_id, "job-1");
        assert!(matches!(&*supervisor.phase.lock().await, Phase::Active(_)));
    }

    #[tokio::test]
    async fn resume_on_startup_fails_a_job_whose_file_no_longer_matches() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"hello world").expect("write");
        let path = file.path().to_path_buf();

        let (store, _dir) = test_store().await;
        store
            .create_upload(sample_job("job-1", &path.display().to_string(), "0:0"))
            .await
            .unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();

        let supervisor = test_supervisor(store.clone());
        supervisor.clone().resume_on_startup().await;

        assert_eq!(store.get_job("job-1").await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn resume_on_startup_re_enters_uploading_when_fingerprint_matches() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"hello world").expect("write");
        let path = file.path().to_path_buf();
        let fingerprint = FileReader::lock(&path).expect("lock").fingerprint().expect("fingerprint");

        let (store, _dir) = test_store().await;
        store
            .create_upload(sample_job("job-1", &path.display().to_string(), fingerprint.as_str()))
            .await
            .unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();

        let supervisor = test_supervisor(store.clone());
        supervisor.clone().resume_on_startup().await;

        let phase = supervisor.phase.lock().await;
        assert!(matches!(&*phase, Phase::Active(active) if active.upload_id == "job-1"));
    }
}
