//! Configuration module for the upload agent
//!
//! Assembles an immutable [`Config`] snapshot with precedence
//! CLI flags > environment variables > `.env` file > built-in defaults,
//! namespaced `HAUL_*` (see [`Overrides`] for the flag-equivalent struct).

use crate::error::{AgentError, Result};
use std::env;
use std::time::Duration;

fn default_part_size_bytes() -> u64 {
    128 * 1024 * 1024
}

/// Immutable snapshot of every tunable the agent reads more than once.
/// Constructed once at startup; no component mutates it afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub part_size_bytes: u64,
    pub min_part_size_mib: u64,
    pub max_part_size_mib: u64,
    pub max_parts: u32,

    pub workers_min: usize,
    pub workers_max: usize,
    pub workers_auto: bool,

    pub presign_batch_size: usize,
    pub presign_lookahead: usize,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub http_timeout: Duration,
    pub progress_interval: Duration,

    pub ws_port: u16,
    pub backend_url: String,
}

/// CLI-flag overrides; any `Some` field wins over environment/defaults.
/// Mirrors [`Config`]'s fields that a `clap` flag can reasonably set.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub part_size_bytes: Option<u64>,
    pub workers_max: Option<usize>,
    pub ws_port: Option<u16>,
    pub backend_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            part_size_bytes: default_part_size_bytes(),
            min_part_size_mib: 5,
            max_part_size_mib: 512,
            max_parts: 10_000,
            workers_min: 1,
            workers_max: 16,
            workers_auto: true,
            presign_batch_size: 20,
            presign_lookahead: 50,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            http_timeout: Duration::from_secs(300),
            progress_interval: Duration::from_millis(500),
            ws_port: 7777,
            backend_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with precedence: flags > env vars > `.env` file > defaults.
    ///
    /// A `.env` file is loaded once, silently, if present. A present-but-malformed
    /// environment variable (not merely absent) is a hard startup error — we never
    /// fall back to a default for a typo'd value.
    pub fn load(overrides: Overrides) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Some(v) = env_u64("HAUL_PART_SIZE_BYTES")? {
            config.part_size_bytes = v;
        }
        if let Some(v) = env_u64("HAUL_MIN_PART_SIZE_MIB")? {
            config.min_part_size_mib = v;
        }
        if let Some(v) = env_u64("HAUL_MAX_PART_SIZE_MIB")? {
            config.max_part_size_mib = v;
        }
        if let Some(v) = env_u32("HAUL_MAX_PARTS")? {
            config.max_parts = v;
        }
        if let Some(v) = env_usize("HAUL_WORKERS_MIN")? {
            config.workers_min = v;
        }
        if let Some(v) = env_usize("HAUL_WORKERS_MAX")? {
            config.workers_max = v;
            config.workers_auto = false;
        }
        if let Some(v) = env_usize("HAUL_PRESIGN_BATCH_SIZE")? {
            config.presign_batch_size = v;
        }
        if let Some(v) = env_usize("HAUL_PRESIGN_LOOKAHEAD")? {
            config.presign_lookahead = v;
        }
        if let Some(v) = env_u32("HAUL_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = v;
        }
        if let Some(v) = env_u64("HAUL_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("HAUL_RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("HAUL_HTTP_TIMEOUT_S")? {
            config.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("HAUL_PROGRESS_INTERVAL_MS")? {
            config.progress_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u16("HAUL_WS_PORT")? {
            config.ws_port = v;
        }
        if let Ok(v) = env::var("HAUL_BACKEND_URL") {
            config.backend_url = v;
        }

        // CLI flags take highest precedence.
        if let Some(v) = overrides.part_size_bytes {
            config.part_size_bytes = v;
        }
        if let Some(v) = overrides.workers_max {
            config.workers_max = v;
            config.workers_auto = false;
        }
        if let Some(v) = overrides.ws_port {
            config.ws_port = v;
        }
        if let Some(v) = overrides.backend_url {
            config.backend_url = v;
        }

        Ok(config)
    }

    /// `clamp(floor(0.75 * cpu_cores), workers_min, workers_max)`, further clamped
    /// so that `workers * part_size_bytes <= 0.5 * available_memory`.
    pub fn effective_workers(&self, part_size_bytes: u64) -> usize {
        if !self.workers_auto {
            return self.workers_max.max(self.workers_min);
        }

        let cpu_based = ((num_cpus::get() as f64) * 0.75).floor() as usize;
        let mut workers = cpu_based.clamp(self.workers_min, self.workers_max);

        let available_memory = available_memory_bytes();
        if part_size_bytes > 0 && available_memory > 0 {
            let memory_budget = (available_memory as f64 * 0.5) as u64;
            let memory_bound = (memory_budget / part_size_bytes).max(1) as usize;
            workers = workers.min(memory_bound).max(self.workers_min.min(workers));
        }

        workers.max(1)
    }
}

/// Default colocated-database directory when `--data-dir` isn't given:
/// the OS-conventional local data directory for `haul` (`ProjectDirs`),
/// falling back to `./.haul` if the platform has no notion of one (e.g. a
/// minimal container) — mirroring the profile-directory lookup this
/// codebase's OAuth layer used, minus the persisted profiles themselves.
pub fn default_data_dir() -> std::path::PathBuf {
    directories::ProjectDirs::from("", "", "haul")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from(".haul"))
}

fn available_memory_bytes() -> u64 {
    use sysinfo::{RefreshKind, System};
    let sys = System::new_with_specifics(RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()));
    sys.available_memory()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Some).map_err(|e| parse_err(key, &v, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(AgentError::Internal { message: format!("{key}: {e}") }),
    }
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match env::var(key) {
        Ok(v) => v.parse::<u32>().map(Some).map_err(|e| parse_err(key, &v, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(AgentError::Internal { message: format!("{key}: {e}") }),
    }
}

fn env_u16(key: &str) -> Result<Option<u16>> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().map(Some).map_err(|e| parse_err(key, &v, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(AgentError::Internal { message: format!("{key}: {e}") }),
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map(Some).map_err(|e| parse_err(key, &v, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(AgentError::Internal { message: format!("{key}: {e}") }),
    }
}

fn parse_err(key: &str, value: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::Internal {
        message: format!("invalid value for {key}={value:?}: {e}"),
    }
}
