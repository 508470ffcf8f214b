//! Domain types shared across the kernel, state store, transfer, and control crates.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an [`UploadJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in-progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// At most one job may be in one of these statuses at a time (invariant 6).
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::InProgress | JobStatus::Paused)
    }
}

/// Lifecycle status of a single [`PartRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl PartStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PartStatus::Pending => "pending",
            PartStatus::Uploading => "uploading",
            PartStatus::Completed => "completed",
            PartStatus::Failed => "failed",
        }
    }
}

/// One active (or formerly active) transfer.
///
/// Primary key is `upload_id`, the opaque identifier minted by the coordinator
/// during `initiate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub upload_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    /// `"{size}:{last_modified_utc_ticks}"` — see [`Fingerprint`].
    pub fingerprint: String,
    pub bucket: String,
    pub object_key: String,
    pub part_size: u64,
    pub total_parts: u32,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One part of one job. Composite key `(upload_id, part_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRow {
    pub upload_id: String,
    /// 1-based, contiguous within `[1, total_parts]`.
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    /// Non-empty iff `status == Completed` (invariant 3).
    pub etag: Option<String>,
    pub status: PartStatus,
    pub retry_count: u32,
}

/// A planned byte range for one part, produced by the File Reader's `slice`
/// before any part row exists in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
}

/// Cheap file identity used only to detect mutation between sessions
/// (§3 invariant 7). Never hashes file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `size:last_modified_utc_ticks`, where ticks are whole seconds since
    /// the Unix epoch — matching the wire format other agents in this system
    /// expect to parse.
    pub fn new(size: u64, last_modified_utc_ticks: i64) -> Self {
        Self(format!("{size}:{last_modified_utc_ticks}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format() {
        let fp = Fingerprint::new(1024, 1_700_000_000);
        assert_eq!(fp.as_str(), "1024:1700000000");
    }

    #[test]
    fn job_status_active_set() {
        assert!(JobStatus::InProgress.is_active());
        assert!(JobStatus::Paused.is_active());
        assert!(!JobStatus::Pending.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Failed.is_active());
        assert!(!JobStatus::Cancelled.is_active());
    }
}
