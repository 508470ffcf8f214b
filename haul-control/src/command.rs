//! Inbound commands (§6 `{action, filePath?, uploadId?, backendUrl?}`).
//! Unknown actions are ignored, not rejected (§4.7).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RawCommand {
    action: String,
    #[serde(rename = "filePath")]
    file_path: Option<String>,
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
    #[serde(rename = "backendUrl")]
    backend_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { file_path: Option<String>, upload_id: Option<String>, backend_url: Option<String> },
    Pause,
    Resume,
    Cancel,
}

impl Command {
    /// Parses one inbound WebSocket text frame. Returns `None` for malformed
    /// JSON or an unrecognized `action` — both are silently ignored per spec,
    /// not surfaced as protocol errors.
    pub fn parse(text: &str) -> Option<Self> {
        let raw: RawCommand = serde_json::from_str(text).ok()?;
        match raw.action.as_str() {
            "start" => Some(Command::Start {
                file_path: raw.file_path,
                upload_id: raw.upload_id,
                backend_url: raw.backend_url,
            }),
            "pause" => Some(Command::Pause),
            "resume" => Some(Command::Resume),
            "cancel" => Some(Command::Cancel),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_file_path() {
        let cmd = Command::parse(r#"{"action":"start","filePath":"/tmp/big.bin"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                file_path: Some("/tmp/big.bin".into()),
                upload_id: None,
                backend_url: None
            }
        );
    }

    #[test]
    fn parses_pause_resume_cancel() {
        assert_eq!(Command::parse(r#"{"action":"pause"}"#).unwrap(), Command::Pause);
        assert_eq!(Command::parse(r#"{"action":"resume"}"#).unwrap(), Command::Resume);
        assert_eq!(Command::parse(r#"{"action":"cancel"}"#).unwrap(), Command::Cancel);
    }

    #[test]
    fn unknown_action_is_ignored() {
        assert!(Command::parse(r#"{"action":"teleport"}"#).is_none());
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert!(Command::parse("not json").is_none());
    }
}
