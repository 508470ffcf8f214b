//! [`StateStore`]: the durable, transactional-batch key/value store backing
//! upload jobs and part rows.
//!
//! Every public method offloads its blocking `sled` call onto the blocking
//! thread pool via `tokio::task::spawn_blocking`, so callers on the async
//! runtime never stall a worker thread on disk I/O — `sled::Db` is cheap to
//! clone (an `Arc` internally) so each call clones its own handle into the
//! blocking closure.

use crate::keys::{job_prefix, part_key};
use haul_kernel::{AgentError, JobStatus, PartRow, PartStatus, Result, UploadJob};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;

/// A durable store for [`UploadJob`] and [`PartRow`] rows.
///
/// Clone is cheap (wraps a `sled::Db`, itself reference-counted); every
/// clone talks to the same on-disk database.
#[derive(Clone)]
pub struct StateStore {
    db: sled::Db,
}

fn store_err(context: &str, err: impl std::fmt::Display) -> AgentError {
    AgentError::StateStore {
        message: format!("{context}: {err}"),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| store_err("encode", e))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| store_err("decode", e))
}

impl StateStore {
    /// Open (or create) the embedded database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || sled::open(path))
            .await
            .map_err(|e| store_err("open join", e))?
            .map_err(|e| store_err("open", e))?;
        Ok(Self { db })
    }

    fn jobs(&self) -> Result<sled::Tree> {
        self.db.open_tree("jobs").map_err(|e| store_err("open jobs tree", e))
    }

    fn parts(&self) -> Result<sled::Tree> {
        self.db.open_tree("parts").map_err(|e| store_err("open parts tree", e))
    }

    /// Inserts one job row. Fails if `upload_id` already exists.
    pub async fn create_upload(&self, job: UploadJob) -> Result<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let jobs = db.jobs()?;
            let key = job.upload_id.as_bytes();
            if jobs.contains_key(key).map_err(|e| store_err("contains_key", e))? {
                return Err(AgentError::StateStore {
                    message: format!("upload {} already exists", job.upload_id),
                });
            }
            let value = encode(&job)?;
            jobs.insert(key, value).map_err(|e| store_err("insert job", e))?;
            jobs.flush().map_err(|e| store_err("flush jobs", e))?;
            Ok(())
        })
        .await
        .map_err(|e| store_err("create_upload join", e))?
    }

    /// Atomically inserts every part row of a job in a single batch.
    pub async fn init_parts(&self, parts: Vec<PartRow>) -> Result<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let tree = db.parts()?;
            let mut batch = sled::Batch::default();
            for part in &parts {
                let key = part_key(&part.upload_id, part.part_number);
                let value = encode(part)?;
                batch.insert(key, value);
            }
            tree.apply_batch(batch).map_err(|e| store_err("apply_batch", e))?;
            tree.flush().map_err(|e| store_err("flush parts", e))?;
            Ok(())
        })
        .await
        .map_err(|e| store_err("init_parts join", e))?
    }

    async fn get_part(&self, upload_id: &str, part_number: u32) -> Result<Option<PartRow>> {
        let db = self.clone();
        let upload_id = upload_id.to_string();
        tokio::task::spawn_blocking(move || {
            let tree = db.parts()?;
            let key = part_key(&upload_id, part_number);
            match tree.get(key).map_err(|e| store_err("get part", e))? {
                Some(bytes) => Ok(Some(decode(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| store_err("get_part join", e))?
    }

    fn require_part(row: Option<PartRow>, upload_id: &str, part_number: u32) -> Result<PartRow> {
        row.ok_or_else(|| AgentError::StateStore {
            message: format!("no part row for {upload_id}/{part_number}"),
        })
    }

    /// Marks a part `uploading`. Idempotent.
    pub async fn mark_uploading(&self, upload_id: &str, part_number: u32) -> Result<()> {
        let mut row = Self::require_part(
            self.get_part(upload_id, part_number).await?,
            upload_id,
            part_number,
        )?;
        row.status = PartStatus::Uploading;
        self.put_part(row).await
    }

    /// Marks a part `completed` with its storage receipt.
    ///
    /// Refuses (invariant 3) if the part is already `completed` with a
    /// *different* etag — a retry that resolves after a sibling retry already
    /// won the race must not silently overwrite the recorded receipt.
    pub async fn mark_completed(
        &self,
        upload_id: &str,
        part_number: u32,
        etag: String,
    ) -> Result<()> {
        let mut row = Self::require_part(
            self.get_part(upload_id, part_number).await?,
            upload_id,
            part_number,
        )?;
        if row.status == PartStatus::Completed {
            if row.etag.as_deref() == Some(etag.as_str()) {
                return Ok(());
            }
            return Err(AgentError::StateStore {
                message: format!(
                    "part {upload_id}/{part_number} already completed with a different etag"
                ),
            });
        }
        row.status = PartStatus::Completed;
        row.etag = Some(etag);
        self.put_part(row).await
    }

    /// Marks a part `failed`, bumping `retry_count`.
    pub async fn mark_failed(&self, upload_id: &str, part_number: u32) -> Result<u32> {
        let mut row = Self::require_part(
            self.get_part(upload_id, part_number).await?,
            upload_id,
            part_number,
        )?;
        row.status = PartStatus::Failed;
        row.retry_count += 1;
        let retry_count = row.retry_count;
        self.put_part(row).await?;
        Ok(retry_count)
    }

    async fn put_part(&self, row: PartRow) -> Result<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let tree = db.parts()?;
            let key = part_key(&row.upload_id, row.part_number);
            let value = encode(&row)?;
            // Single-tree transaction: guards the read-modify-write above
            // against a concurrent writer for the same row (mark_completed's
            // etag-conflict check must see a consistent snapshot).
            tree.transaction(|tx| {
                tx.insert(key.as_slice(), value.as_slice())?;
                Ok::<_, ConflictableTransactionError<AgentError>>(())
            })
            .map_err(|e: TransactionError<AgentError>| store_err("put_part transaction", e))?;
            tree.flush().map_err(|e| store_err("flush part", e))?;
            Ok(())
        })
        .await
        .map_err(|e| store_err("put_part join", e))?
    }

    /// Rows with status in `{pending, failed}` and `retry_count < max_retries`,
    /// ordered by `part_number`.
    pub async fn get_pending(&self, upload_id: &str, max_retries: u32) -> Result<Vec<PartRow>> {
        let rows = self.scan_parts(upload_id).await?;
        Ok(rows
            .into_iter()
            .filter(|r| {
                matches!(r.status, PartStatus::Pending | PartStatus::Failed)
                    && r.retry_count < max_retries
            })
            .collect())
    }

    /// Rows in `completed`, ordered by `part_number`.
    pub async fn get_completed(&self, upload_id: &str) -> Result<Vec<(u32, String)>> {
        let rows = self.scan_parts(upload_id).await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.status == PartStatus::Completed)
            .filter_map(|r| r.etag.map(|etag| (r.part_number, etag)))
            .collect())
    }

    /// Count of parts in `completed`, for progress reporting.
    pub async fn count_completed(&self, upload_id: &str) -> Result<u32> {
        let rows = self.scan_parts(upload_id).await?;
        Ok(rows.iter().filter(|r| r.status == PartStatus::Completed).count() as u32)
    }

    async fn scan_parts(&self, upload_id: &str) -> Result<Vec<PartRow>> {
        let db = self.clone();
        let upload_id = upload_id.to_string();
        tokio::task::spawn_blocking(move || {
            let tree = db.parts()?;
            let prefix = job_prefix(&upload_id);
            let mut rows = Vec::new();
            for entry in tree.scan_prefix(&prefix) {
                let (_, value) = entry.map_err(|e| store_err("scan parts", e))?;
                rows.push(decode(&value)?);
            }
            Ok(rows)
        })
        .await
        .map_err(|e| store_err("scan_parts join", e))?
    }

    /// Updates a job's status in place.
    pub async fn update_job_status(&self, upload_id: &str, status: JobStatus) -> Result<()> {
        let mut job = self
            .get_job(upload_id)
            .await?
            .ok_or_else(|| AgentError::StateStore {
                message: format!("no job row for {upload_id}"),
            })?;
        job.status = status;
        if status == JobStatus::Completed {
            job.completed_at = Some(chrono::Utc::now());
        }
        self.put_job(job).await
    }

    async fn put_job(&self, job: UploadJob) -> Result<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let jobs = db.jobs()?;
            let key = job.upload_id.as_bytes();
            let value = encode(&job)?;
            jobs.insert(key, value).map_err(|e| store_err("update job", e))?;
            jobs.flush().map_err(|e| store_err("flush job", e))?;
            Ok(())
        })
        .await
        .map_err(|e| store_err("put_job join", e))?
    }

    /// Fetches the persisted job row, if any.
    pub async fn get_job(&self, upload_id: &str) -> Result<Option<UploadJob>> {
        let db = self.clone();
        let upload_id = upload_id.to_string();
        tokio::task::spawn_blocking(move || {
            let jobs = db.jobs()?;
            match jobs.get(upload_id.as_bytes()).map_err(|e| store_err("get job", e))? {
                Some(bytes) => Ok(Some(decode(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| store_err("get_job join", e))?
    }

    /// The one job (if any) whose status is `in-progress` or `paused` — crash-
    /// resume discovery at startup. Invariant 6 guarantees at most one match.
    pub async fn find_resumable_job(&self) -> Result<Option<UploadJob>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let jobs = db.jobs()?;
            for entry in jobs.iter() {
                let (_, value) = entry.map_err(|e| store_err("scan jobs", e))?;
                let job: UploadJob = decode(&value)?;
                if job.status.is_active() {
                    return Ok(Some(job));
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| store_err("find_resumable_job join", e))?
    }

    /// Removes the job row and all of its part rows. The only operation that
    /// deletes rows (§3 Lifecycle).
    pub async fn delete_job(&self, upload_id: &str) -> Result<()> {
        let db = self.clone();
        let upload_id = upload_id.to_string();
        tokio::task::spawn_blocking(move || {
            let jobs = db.jobs()?;
            let parts = db.parts()?;
            jobs.remove(upload_id.as_bytes()).map_err(|e| store_err("remove job", e))?;
            let prefix = job_prefix(&upload_id);
            let keys: Vec<_> = parts
                .scan_prefix(&prefix)
                .keys()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| store_err("scan for delete", e))?;
            let mut batch = sled::Batch::default();
            for key in keys {
                batch.remove(key);
            }
            parts.apply_batch(batch).map_err(|e| store_err("delete batch", e))?;
            jobs.flush().map_err(|e| store_err("flush jobs delete", e))?;
            parts.flush().map_err(|e| store_err("flush parts delete", e))?;
            Ok(())
        })
        .await
        .map_err(|e| store_err("delete_job join", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_kernel::JobStatus;

    fn sample_job(upload_id: &str) -> UploadJob {
        UploadJob {
            upload_id: upload_id.to_string(),
            file_path: "/tmp/f".to_string(),
            file_name: "f".to_string(),
            file_size: 300,
            fingerprint: "300:0".to_string(),
            bucket: "bucket".to_string(),
            object_key: "key".to_string(),
            part_size: 100,
            total_parts: 3,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    fn sample_parts(upload_id: &str) -> Vec<PartRow> {
        (1..=3)
            .map(|n| PartRow {
                upload_id: upload_id.to_string(),
                part_number: n,
                byte_offset: (n as u64 - 1) * 100,
                byte_length: 100,
                etag: None,
                status: PartStatus::Pending,
                retry_count: 0,
            })
            .collect()
    }

    async fn open_temp() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("db")).await.expect("open");
        (store, dir)
    }

    #[tokio::test]
    async fn create_upload_rejects_duplicate() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.expect("first create");
        let err = store.create_upload(sample_job("job-1")).await.unwrap_err();
        assert!(matches!(err, AgentError::StateStore { .. }));
    }

    #[tokio::test]
    async fn init_parts_then_get_pending_is_ordered() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        let pending = store.get_pending("job-1", 3).await.unwrap();
        let numbers: Vec<u32> = pending.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mark_completed_then_get_completed() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        store.mark_uploading("job-1", 1).await.unwrap();
        store.mark_completed("job-1", 1, "etag-1".to_string()).await.unwrap();

        let completed = store.get_completed("job-1").await.unwrap();
        assert_eq!(completed, vec![(1, "etag-1".to_string())]);
        assert_eq!(store.count_completed("job-1").await.unwrap(), 1);

        let pending = store.get_pending("job-1", 3).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn mark_completed_refuses_conflicting_etag() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        store.mark_completed("job-1", 1, "etag-a".to_string()).await.unwrap();
        let err = store
            .mark_completed("job-1", 1, "etag-b".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StateStore { .. }));

        // Re-marking with the *same* etag is idempotent, not an error.
        store.mark_completed("job-1", 1, "etag-a".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn mark_failed_increments_retry_count() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        assert_eq!(store.mark_failed("job-1", 2).await.unwrap(), 1);
        assert_eq!(store.mark_failed("job-1", 2).await.unwrap(), 2);
        let pending = store.get_pending("job-1", 3).await.unwrap();
        assert!(pending.iter().any(|p| p.part_number == 2 && p.retry_count == 2));
        let excluded = store.get_pending("job-1", 2).await.unwrap();
        assert!(!excluded.iter().any(|p| p.part_number == 2));
    }

    #[tokio::test]
    async fn find_resumable_job_matches_active_statuses_only() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        assert!(store.find_resumable_job().await.unwrap().is_none());

        store.update_job_status("job-1", JobStatus::InProgress).await.unwrap();
        let resumable = store.find_resumable_job().await.unwrap();
        assert_eq!(resumable.unwrap().upload_id, "job-1");

        store.update_job_status("job-1", JobStatus::Completed).await.unwrap();
        assert!(store.find_resumable_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_job_removes_job_and_parts() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        store.delete_job("job-1").await.unwrap();
        assert!(store.get_job("job-1").await.unwrap().is_none());
        assert!(store.get_pending("job-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parts_from_different_jobs_do_not_leak() {
        let (store, _dir) = open_temp().await;
        store.create_upload(sample_job("job-1")).await.unwrap();
        store.init_parts(sample_parts("job-1")).await.unwrap();
        store.create_upload(sample_job("job-10")).await.unwrap();
        store.init_parts(sample_parts("job-10")).await.unwrap();

        assert_eq!(store.get_pending("job-1", 10).await.unwrap().len(), 3);
        assert_eq!(store.get_pending("job-10", 10).await.unwrap().len(), 3);
        store.delete_job("job-1").await.unwrap();
        assert_eq!(store.get_pending("job-10", 10).await.unwrap().len(), 3);
    }
}
