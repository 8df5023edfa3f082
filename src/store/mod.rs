//! Chunk storage keyed by file fingerprint.
//!
//! The assembler only talks to [`ChunkStore`], so a deployment can back it
//! with the local filesystem, memory, or anything else that can hold bytes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use crate::error::StoreError;
use crate::models::{Artifact, StatsResponse};

mod fs;
mod memory;

pub use fs::FsChunkStore;
pub use memory::MemoryChunkStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// persistent chunk sets and merged artifacts, addressed by fingerprint
pub trait ChunkStore: Send + Sync {
    /// the merged artifact for a fingerprint, if a merge has completed
    fn artifact<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<Artifact>>;

    /// indices currently persisted for a fingerprint, ascending
    fn chunk_indices<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Vec<u32>>;

    /// store one chunk, replacing any previous payload at that index
    fn put_chunk<'a>(&'a self, fingerprint: &'a str, index: u32, data: Bytes) -> StoreFuture<'a, ()>;

    /// concatenate chunks `0..total_chunks` in index order into the final
    /// artifact. Fails without writing anything when a chunk is missing or
    /// the assembled length differs from `expected_size`. On success the
    /// chunk set is removed and the artifact recorded.
    fn assemble<'a>(
        &'a self,
        fingerprint: &'a str,
        file_name: &'a str,
        total_chunks: u32,
        expected_size: u64,
    ) -> StoreFuture<'a, Artifact>;

    /// drop every stored chunk of a fingerprint; `false` if there were none
    fn purge_chunks<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, bool>;

    /// fingerprints whose chunk sets saw no writes for longer than `idle`
    fn stale_chunk_sets(&self, idle: Duration) -> StoreFuture<'_, Vec<String>>;

    fn list_artifacts(&self) -> StoreFuture<'_, Vec<Artifact>>;

    fn stats(&self) -> StoreFuture<'_, StatsResponse>;
}

/// fail with the first gap and the gap count unless every index in `0..total`
/// is in the ascending, duplicate-free `present` list
pub(crate) fn ensure_complete(present: &[u32], total: u32) -> Result<(), StoreError> {
    let stored = present.iter().filter(|&&i| i < total).count() as u32;
    if stored == total {
        return Ok(());
    }
    let first_missing = present
        .iter()
        .enumerate()
        .find(|(pos, &index)| index != *pos as u32)
        .map(|(pos, _)| pos as u32)
        .unwrap_or(present.len() as u32);
    Err(StoreError::IncompleteChunks {
        first_missing,
        missing: total - stored,
        total,
    })
}
