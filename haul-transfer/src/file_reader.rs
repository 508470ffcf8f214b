//! The File Reader: an exclusive, read-shared handle on the source file.
//!
//! Holding this handle for the job's lifetime is the anti-tamper guarantee —
//! other processes can still read the file but cannot write or delete it
//! while a transfer is in flight. Positional reads let every worker read
//! concurrently without a shared seek cursor (§4.3, §5).

use fs2::FileExt;
use haul_kernel::{AgentError, Config, PartDescriptor, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

/// Owns the OS file handle for one job's lifetime.
///
/// Cheap to clone: wraps an `Arc<File>` so every worker can hold its own
/// handle to call [`FileReader::read_at`] concurrently.
#[derive(Clone)]
pub struct FileReader {
    file: Arc<File>,
    path: PathBuf,
}

impl FileReader {
    /// Opens `path` and takes a shared (advisory) lock: denies another
    /// process from taking an *exclusive* lock on the same file (its closest
    /// cross-platform approximation of "shared-read/denied-write/denied-
    /// delete") while still permitting ordinary reads elsewhere.
    pub fn lock(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| AgentError::FileLockFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        file.try_lock_shared().map_err(|e| AgentError::FileLockFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { file: Arc::new(file), path })
    }

    /// `"{size}:{last_modified_utc_ticks}"`. Never hashes file contents.
    pub fn fingerprint(&self) -> Result<haul_kernel::Fingerprint> {
        let metadata = self.file.metadata().map_err(|e| AgentError::Internal {
            message: format!("failed to stat {}: {e}", self.path.display()),
        })?;
        let size = metadata.len();
        let modified = metadata.modified().map_err(|e| AgentError::Internal {
            message: format!("failed to read mtime of {}: {e}", self.path.display()),
        })?;
        let ticks = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(haul_kernel::Fingerprint::new(size, ticks))
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(|e| AgentError::Internal { message: e.to_string() })?.len())
    }

    /// Positional read, fully satisfied or a short buffer at EOF. Safe to
    /// call concurrently from multiple workers: no shared seek cursor.
    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || read_at_sync(&file, offset, length))
            .await
            .map_err(|e| AgentError::Internal { message: format!("read_at join: {e}") })?
    }

    /// Drops the handle, releasing the lock.
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(unix)]
fn read_at_sync(file: &File, offset: u64, length: u64) -> Result<Vec<u8>> {
    use std::os::unix::fs::FileExt as UnixFileExt;
    let mut buf = vec![0u8; length as usize];
    let mut total = 0usize;
    loop {
        match UnixFileExt::read_at(file, &mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    break;
                }
            }
            Err(e) => {
                return Err(AgentError::Internal { message: format!("read_at: {e}") });
            }
        }
    }
    buf.truncate(total);
    Ok(buf)
}

#[cfg(windows)]
fn read_at_sync(file: &File, offset: u64, length: u64) -> Result<Vec<u8>> {
    use std::os::windows::fs::FileExt as WindowsFileExt;
    let mut buf = vec![0u8; length as usize];
    let mut total = 0usize;
    loop {
        match WindowsFileExt::seek_read(file, &mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    break;
                }
            }
            Err(e) => {
                return Err(AgentError::Internal { message: format!("seek_read: {e}") });
            }
        }
    }
    buf.truncate(total);
    Ok(buf)
}

fn div_ceil(a: u64, b: u64) -> u64 {
    if a == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// `total_parts = ceil(file_size / part_size)`; every part but the last has
/// length `part_size`, the last has the remainder. `file_size == 0` yields
/// exactly one zero-length part (§4.3).
pub fn slice(file_size: u64, part_size: u64) -> Vec<PartDescriptor> {
    if file_size == 0 {
        return vec![PartDescriptor { part_number: 1, byte_offset: 0, byte_length: 0 }];
    }
    let total_parts = div_ceil(file_size, part_size).max(1);
    let mut parts = Vec::with_capacity(total_parts as usize);
    let mut offset = 0u64;
    for i in 1..=total_parts {
        let length = if i == total_parts { file_size - offset } else { part_size };
        parts.push(PartDescriptor {
            part_number: i as u32,
            byte_offset: offset,
            byte_length: length,
        });
        offset += length;
    }
    parts
}

/// If `ceil(file_size / config.part_size_bytes) > config.max_parts`, rounds
/// the part size up to the nearest 16 MiB multiple that brings the part
/// count back within `max_parts`, capped by `max_part_size_mib`. Returns
/// `upload_error` if even the cap can't bring the file within `max_parts`
/// (spec §8 scenario D).
pub fn auto_size_part(file_size: u64, config: &Config) -> Result<u64> {
    let min_size = config.min_part_size_mib * MIB;
    let max_size = config.max_part_size_mib * MIB;
    let mut part_size = config.part_size_bytes.max(min_size);

    let needed = |size: u64| -> u64 {
        if file_size == 0 {
            1
        } else {
            div_ceil(file_size, size)
        }
    };

    if needed(part_size) > config.max_parts as u64 {
        const MIB16: u64 = 16 * MIB;
        let min_for_cap = div_ceil(file_size, config.max_parts as u64).max(1);
        part_size = div_ceil(min_for_cap, MIB16) * MIB16;
        part_size = part_size.max(min_size);
    }

    if part_size > max_size {
        return Err(AgentError::UploadError {
            message: format!(
                "file of {file_size} bytes needs a part size of at least {part_size} bytes to stay within max_parts={}, exceeding max_part_size_mib={}",
                config.max_parts, config.max_part_size_mib
            ),
        });
    }

    Ok(part_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_exact_multiple() {
        let parts = slice(256 * MIB, 128 * MIB);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].byte_length, 128 * MIB);
        assert_eq!(parts[1].byte_length, 128 * MIB);
        assert_eq!(parts[1].byte_offset, 128 * MIB);
    }

    #[test]
    fn slice_ragged_tail() {
        let parts = slice(200 * MIB, 128 * MIB);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].byte_length, 128 * MIB);
        assert_eq!(parts[1].byte_length, 72 * MIB);
        let total: u64 = parts.iter().map(|p| p.byte_length).sum();
        assert_eq!(total, 200 * MIB);
    }

    #[test]
    fn slice_single_small_part() {
        let parts = slice(10 * MIB, 128 * MIB);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].byte_length, 10 * MIB);
    }

    #[test]
    fn slice_zero_size_file_yields_one_empty_part() {
        let parts = slice(0, 128 * MIB);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].byte_length, 0);
        assert_eq!(parts[0].byte_offset, 0);
    }

    #[test]
    fn slice_offsets_are_contiguous() {
        let parts = slice(1_000_003, 100_000);
        let mut expected_offset = 0u64;
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number, (i + 1) as u32);
            assert_eq!(part.byte_offset, expected_offset);
            expected_offset += part.byte_length;
        }
        assert_eq!(expected_offset, 1_000_003);
    }

    #[test]
    fn auto_size_respects_max_parts_for_huge_files() {
        let mut config = Config::default();
        config.max_part_size_mib = 1024; // wide enough for a 5 TiB file to fit under max_parts
        let file_size = 5 * 1024 * 1024 * 1024 * 1024u64; // 5 TiB
        let part_size = auto_size_part(file_size, &config).expect("fits under cap");
        assert!(div_ceil(file_size, part_size) <= config.max_parts as u64);
        assert_eq!(part_size % (16 * MIB), 0);
        assert!(part_size <= config.max_part_size_mib * MIB);
    }

    #[test]
    fn auto_size_fails_when_even_the_cap_is_not_enough() {
        let mut config = Config::default();
        config.max_part_size_mib = 64; // far too small for a 5 TiB file at max_parts=10_000
        let file_size = 5 * 1024 * 1024 * 1024 * 1024u64;
        let err = auto_size_part(file_size, &config).unwrap_err();
        assert!(matches!(err, AgentError::UploadError { .. }));
    }

    /// Spec §8 scenario D: with the *default* config, a 5 TiB file needs a
    /// part size just over the default `max_part_size_mib` (512) to stay
    /// within `max_parts`, so auto-sizing must fail rather than silently
    /// exceed the cap.
    #[test]
    fn auto_size_with_default_config_surfaces_upload_error_for_5tib_file() {
        let config = Config::default();
        let file_size = 5 * 1024 * 1024 * 1024 * 1024u64;
        let err = auto_size_part(file_size, &config).unwrap_err();
        assert!(matches!(err, AgentError::UploadError { .. }));
    }

    #[test]
    fn auto_size_leaves_small_files_untouched() {
        let config = Config::default();
        let part_size = auto_size_part(200 * MIB, &config).expect("small file");
        assert_eq!(part_size, config.part_size_bytes);
    }

    proptest::proptest! {
        /// Spec §8 property 1: slicing partitions `[0, file_size)` contiguously,
        /// every non-final part is exactly `part_size` long, and the final part
        /// is no longer than `part_size`.
        #[test]
        fn prop_slice_covers_the_file(
            file_size in 0u64..=20_000_000u64,
            part_size in 1u64..=5_000_000u64,
        ) {
            let parts = slice(file_size, part_size);
            let mut expected_offset = 0u64;
            let last = parts.len() - 1;
            for (i, part) in parts.iter().enumerate() {
                proptest::prop_assert_eq!(part.part_number, (i + 1) as u32);
                proptest::prop_assert_eq!(part.byte_offset, expected_offset);
                if i != last {
                    proptest::prop_assert_eq!(part.byte_length, part_size);
                } else {
                    proptest::prop_assert!(part.byte_length <= part_size);
                    if file_size > 0 {
                        proptest::prop_assert!(part.byte_length > 0);
                    }
                }
                expected_offset += part.byte_length;
            }
            proptest::prop_assert_eq!(expected_offset, file_size);
        }

        /// Spec §8 property 2: auto-sizing, whenever it succeeds, always yields
        /// a part count within `max_parts` and a part size within
        /// `[min_part_size, max_part_size]`.
        #[test]
        fn prop_auto_size_respects_bounds(
            file_size in 0u64..=2_000_000_000_000u64,
            max_part_size_mib in 512u64..=5000u64,
        ) {
            let mut config = Config::default();
            config.max_part_size_mib = max_part_size_mib;
            if let Ok(part_size) = auto_size_part(file_size, &config) {
                let min_size = config.min_part_size_mib * MIB;
                let max_size = config.max_part_size_mib * MIB;
                proptest::prop_assert!(part_size >= min_size);
                proptest::prop_assert!(part_size <= max_size);
                let total_parts = if file_size == 0 { 1 } else { div_ceil(file_size, part_size) };
                proptest::prop_assert!(total_parts <= config.max_parts as u64);
            }
        }
    }
}
