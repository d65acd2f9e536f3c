//! Object store types
//!
//! Defines the backend-neutral object description and the B2 API response types
//! that are converted into it.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// User metadata attached to an object (string keys and values)
pub type Metadata = HashMap<String, String>;

/// Description of one stored object, as returned by listings and heads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object name within the bucket
    pub name: String,
    /// Object size in bytes
    pub content_length: u64,
    /// Last write time in milliseconds since epoch
    pub last_modified: u64,
    /// User metadata
    pub metadata: Metadata,
    /// Store-specific file identifier (B2 file id), if the backend has one
    pub file_id: Option<String>,
}

/// One page of a listing. `next` is set when the listing was truncated and
/// holds the (inclusive) name to continue from.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub next: Option<String>,
}

impl ListPage {
    /// Whether more results exist beyond this page
    pub fn is_truncated(&self) -> bool {
        self.next.is_some()
    }
}

/// Numeric field that B2 may send as a number, a numeric string, or null
/// (folder and hide entries). Null reads as 0.
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Number(n)) => Ok(n),
        Some(Raw::Text(text)) => text.parse().map_err(serde::de::Error::custom),
    }
}

/// Entry of a `b2_list_file_names` response, also returned by uploads and copies
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_name: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub content_length: u64,
    /// Milliseconds since epoch; serves as the object's last-modified time
    #[serde(deserialize_with = "lenient_u64")]
    pub upload_timestamp: u64,
    /// "upload", "folder", "hide" or "start"
    pub action: String,
    #[serde(default)]
    pub file_id: Option<String>,
    /// `X-Bz-Info-*` headers given at upload, where cache metadata lives
    #[serde(default)]
    pub file_info: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    pub files: Vec<FileInfo>,
    /// Inclusive start of the next page; absent on the last page
    pub next_file_name: Option<String>,
}

impl FileInfo {
    /// Whether this entry is a finished object rather than a folder, hide marker or pending upload
    pub fn is_object(&self) -> bool {
        self.action == "upload" && !self.file_name.ends_with('/')
    }
}

impl From<FileInfo> for ObjectInfo {
    fn from(file: FileInfo) -> Self {
        ObjectInfo {
            name: file.file_name,
            content_length: file.content_length,
            last_modified: file.upload_timestamp,
            metadata: file.file_info,
            file_id: file.file_id,
        }
    }
}

/// Sidecar record stored next to each object by the local backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSidecar {
    #[serde(default)]
    pub metadata: Metadata,
}
