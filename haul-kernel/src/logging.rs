//! Structured logging init and secret redaction.
//!
//! The agent is a long-running local daemon, not a one-shot CLI invocation,
//! so it logs through `tracing` rather than the atomic-bool/eprintln style
//! used elsewhere in this codebase's command-line surface. `--verbose`/
//! `--debug` flags at the CLI boundary only raise the `EnvFilter` level.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber.
///
/// `verbose` raises the default filter to `debug`, `debug` raises it further
/// to `trace`; either is overridden by an explicit `RUST_LOG` environment
/// variable, which always wins.
pub fn init(verbose: bool, debug: bool) {
    let default_level = if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("haul={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

static SECRET_PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
static QUERY_SIG_PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

fn secret_pattern() -> &'static regex::Regex {
    SECRET_PATTERN.get_or_init(|| {
        regex::Regex::new(r#"(?i)(authorization|bearer|token|secret|api[_-]?key)(["'\s:=]+)([^\s"',}]+)"#)
            .expect("secret redaction pattern is a valid literal regex")
    })
}

fn query_sig_pattern() -> &'static regex::Regex {
    QUERY_SIG_PATTERN.get_or_init(|| {
        regex::Regex::new(r"(?i)([?&](?:X-Amz-Signature|X-Amz-Credential|Signature)=)[^&\s]+")
            .expect("query signature redaction pattern is a valid literal regex")
    })
}

/// Redact bearer tokens, API keys, and presigned-URL query signatures before
/// a request/response line reaches the log. Presigned upload/download URLs
/// are logged at `debug` with this redaction applied; never log them raw.
pub fn redact(input: &str) -> String {
    let redacted = secret_pattern().replace_all(input, "$1$2<redacted>");
    query_sig_pattern().replace_all(&redacted, "$1<redacted>").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_token() {
        let line = r#"Authorization: Bearer abc123.def456"#;
        let out = redact(line);
        assert!(!out.contains("abc123"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn redacts_presigned_signature() {
        let url = "https://bucket.s3.amazonaws.com/key?X-Amz-Signature=deadbeef&X-Amz-Expires=900";
        let out = redact(url);
        assert!(!out.contains("deadbeef"));
        assert!(out.contains("X-Amz-Expires=900"));
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        let line = "uploaded part 3 of 10";
        assert_eq!(redact(line), line);
    }
}
