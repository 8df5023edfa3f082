//! Partitioning of a file into fixed-size chunks

use serde::Serialize;

use crate::error::UploadError;

/// default chunk size used by the uploader (2 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// one contiguous byte range `[start, end)` of the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// number of chunks for a file, `ceil(file_size / chunk_size)`
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<u32, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::Validation("chunk size must be non-zero".to_string()));
    }
    u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| {
        UploadError::Validation(format!(
            "file of {} bytes needs too many chunks of {} bytes",
            file_size, chunk_size
        ))
    })
}

/// split `file_size` bytes into ordered, contiguous, non-overlapping chunks
pub fn partition(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, UploadError> {
    let count = chunk_count(file_size, chunk_size)?;
    let chunks = (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            ChunkDescriptor {
                index,
                start,
                end: (start + chunk_size).min(file_size),
            }
        })
        .collect();
    Ok(chunks)
}
