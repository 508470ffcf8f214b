//! HTTP request/response logging, wired into every outbound call the
//! Coordinator Client and Worker Pool make.
//!
//! Mirrors `raps-kernel/src/http/middleware.rs`'s `log_request`/
//! `log_response`: every URL passes through [`crate::logging::redact`]
//! before it reaches a log line, so a presigned-URL query signature or
//! bearer token never appears raw in agent logs.

use crate::logging::redact;
use std::time::Duration;
use tracing::debug;

/// Logs an outbound HTTP request at debug level with its method and a
/// redacted URL.
pub fn log_request(method: &str, url: &str) {
    debug!(method = %method, url = %redact(url), "HTTP request");
}

/// Logs an HTTP response at debug level with its status, redacted URL, and
/// wall-clock duration.
pub fn log_response(status: u16, url: &str, duration: Duration) {
    debug!(
        status = %status,
        url = %redact(url),
        duration_ms = duration.as_millis() as u64,
        "HTTP response"
    );
}
