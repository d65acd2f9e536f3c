//! IPC protocol definitions
//!
//! Newline-delimited JSON exchanged over a Unix domain socket. Requests carry
//! only data; the daemon runs the cache sessions locally.

use serde::{Deserialize, Serialize};

use crate::cache::CacheRequest;
use crate::store::ErrorEntry;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

fn default_true() -> bool {
    true
}

/// Commands sent by build tooling to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Restore the caches of a request
    Restore { request: CacheRequest },
    /// Save the caches of a request once the build has finished
    #[serde(rename_all = "camelCase")]
    Save {
        request: CacheRequest,
        /// A failed build skips saving
        #[serde(default = "default_true")]
        body_succeeded: bool,
    },
    /// Total bytes stored for a job
    Size { job: String },
    /// Delete every cache of a job
    Purge { job: String },
    /// Check that a deleted job has no sessions left
    ForgetJob { job: String },
    /// Get daemon status
    GetStatus,
}

/// Responses sent back by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Status lines of a restore or save
    Report {
        lines: Vec<String>,
        /// Set when a save was attempted and failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Size {
        bytes: u64,
    },
    Success {
        message: Option<String>,
    },
    Error {
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        version: u32,
        healthy: bool,
        backend: String,
        active_locks: usize,
        recent_errors: Vec<ErrorInfo>,
    },
}

/// Store error entry for the status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub timestamp: u64,
    pub operation: String,
    pub path: String,
    pub error: String,
}

impl From<ErrorEntry> for ErrorInfo {
    fn from(entry: ErrorEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            operation: entry.operation,
            path: entry.path,
            error: entry.error,
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    Ok(json)
}
