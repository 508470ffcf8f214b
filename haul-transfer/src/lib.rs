//! File reading, coordinator HTTP client, URL prefetching, and the worker
//! pool that drives the actual part uploads.

#![deny(unsafe_code)]

pub mod coordinator;
pub mod file_reader;
pub mod prefetcher;
pub mod worker_pool;

pub use coordinator::{
    AbortRequest, CompletePart, CompleteRequest, CompleteResponse, CoordinatorClient,
    InitiateRequest, InitiateResponse, PresignedUrlEntry,
};
pub use file_reader::{auto_size_part, slice, FileReader};
pub use prefetcher::{PrefetchBuffer, UrlPrefetcher};
pub use worker_pool::{PauseGate, WorkQueue, WorkerEvent, WorkerPool};
