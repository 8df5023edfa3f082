use serde::{Deserialize, Serialize};

/// success code carried in the response envelope
pub const CODE_OK: u16 = 200;

// response envelope used by every api endpoint
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            code: CODE_OK,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            message: message.into(),
        }
    }

    /// `200` and `0` both count as success
    pub fn is_success(&self) -> bool {
        self.code == CODE_OK || self.code == 0
    }
}

// request for the existence check
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
}

// answer to the existence check
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub exists: bool,
    #[serde(default)]
    pub uploaded_chunk_indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

// metadata sent alongside a chunk body
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub file_fingerprint: String,
    pub file_name: String,
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hash: Option<String>,
    pub total_chunks: u32,
}

// acknowledgement of a stored chunk
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub uploaded: bool,
}

// request to assemble all chunks of a fingerprint
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

// result of a successful merge
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub artifact_ref: String,
    pub file_name: String,
    pub file_size: u64,
}

// a merged artifact, as recorded by the store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub merged_at: chrono::DateTime<chrono::Utc>,
}

impl Artifact {
    /// content-addressed path the public server exposes the artifact under
    pub fn artifact_ref(&self) -> String {
        format!("/files/{}/{}", self.fingerprint, self.file_name)
    }
}

impl From<&Artifact> for MergeResponse {
    fn from(artifact: &Artifact) -> Self {
        Self {
            artifact_ref: artifact.artifact_ref(),
            file_name: artifact.file_name.clone(),
            file_size: artifact.file_size,
        }
    }
}

// response for artifact listing endpoint
#[derive(Serialize, Deserialize, Debug)]
pub struct ArtifactListResponse {
    pub files: Vec<MergeResponse>,
    pub total: usize,
}

// store statistics
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub artifacts: usize,
    pub artifact_bytes: u64,
    pub pending_chunk_sets: usize,
    pub pending_chunks: usize,
    pub pending_bytes: u64,
}

// response for discarding a partial chunk set
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DiscardResponse {
    pub file_fingerprint: String,
    pub discarded: bool,
}
