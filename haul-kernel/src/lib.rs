//! Shared kernel for the haul upload agent: configuration, error types,
//! domain types, HTTP plumbing, and logging. Every other crate in this
//! workspace depends on this one and nothing else depends on them.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod types;

pub use config::{default_data_dir, Config, Overrides};
pub use error::{AgentError, ErrorCode, ExitCode, Result};
pub use http::{HttpClient, HttpClientConfig, RetryConfig};
pub use types::{Fingerprint, JobStatus, PartDescriptor, PartRow, PartStatus, UploadJob};
