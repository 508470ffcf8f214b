//! Outbound wire frames (§6 Control WebSocket). Field names are exactly the
//! ones a browser UI expects — renaming one here changes the wire protocol.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "chunkSizeMB")]
        chunk_size_mb: f64,
        #[serde(rename = "maxThreads")]
        max_threads: usize,
        #[serde(rename = "presignBatchSize")]
        presign_batch_size: usize,
        #[serde(rename = "wsPort")]
        ws_port: u16,
    },
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "uploadId")]
        upload_id: String,
        percent: f64,
        speed: f64,
        eta: f64,
        #[serde(rename = "bytesTransferred")]
        bytes_transferred: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        #[serde(rename = "activeThreads")]
        active_threads: usize,
        #[serde(rename = "completedParts")]
        completed_parts: u32,
        #[serde(rename = "totalParts")]
        total_parts: u32,
    },
    #[serde(rename = "chunk")]
    Chunk {
        #[serde(rename = "uploadId")]
        upload_id: String,
        #[serde(rename = "partNumber")]
        part_number: u32,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        status: String,
        message: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        error: String,
        code: String,
    },
}
