use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use super::{ensure_complete, ChunkStore, StoreFuture};
use crate::error::StoreError;
use crate::models::{Artifact, StatsResponse};

struct MemoryChunkSet {
    chunks: BTreeMap<u32, Bytes>,
    touched: Instant,
}

/// in-process store, the mock backend used by tests and embedded setups
#[derive(Default)]
pub struct MemoryChunkStore {
    chunk_sets: DashMap<String, MemoryChunkSet>,
    artifacts: DashMap<String, (Artifact, Bytes)>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// bytes of a merged artifact
    pub fn artifact_bytes(&self, fingerprint: &str) -> Option<Bytes> {
        self.artifacts.get(fingerprint).map(|entry| entry.1.clone())
    }

    /// payload currently stored for one chunk
    pub fn chunk(&self, fingerprint: &str, index: u32) -> Option<Bytes> {
        self.chunk_sets
            .get(fingerprint)
            .and_then(|set| set.chunks.get(&index).cloned())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn artifact<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<Artifact>> {
        Box::pin(async move { Ok(self.artifacts.get(fingerprint).map(|entry| entry.0.clone())) })
    }

    fn chunk_indices<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Vec<u32>> {
        Box::pin(async move {
            Ok(self
                .chunk_sets
                .get(fingerprint)
                .map(|set| set.chunks.keys().copied().collect())
                .unwrap_or_default())
        })
    }

    fn put_chunk<'a>(&'a self, fingerprint: &'a str, index: u32, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut set = self
                .chunk_sets
                .entry(fingerprint.to_string())
                .or_insert_with(|| MemoryChunkSet {
                    chunks: BTreeMap::new(),
                    touched: Instant::now(),
                });
            set.chunks.insert(index, data);
            set.touched = Instant::now();
            Ok(())
        })
    }

    fn assemble<'a>(
        &'a self,
        fingerprint: &'a str,
        file_name: &'a str,
        total_chunks: u32,
        expected_size: u64,
    ) -> StoreFuture<'a, Artifact> {
        Box::pin(async move {
            let assembled = {
                let set = self.chunk_sets.get(fingerprint);
                let chunks = set.as_ref().map(|s| &s.chunks);
                let present: Vec<u32> = chunks.map(|c| c.keys().copied().collect()).unwrap_or_default();
                ensure_complete(&present, total_chunks)?;

                let mut out = BytesMut::new();
                if let Some(chunks) = chunks {
                    for (_, payload) in chunks.range(..total_chunks) {
                        out.extend_from_slice(payload);
                    }
                }
                out.freeze()
            };

            let actual = assembled.len() as u64;
            if actual != expected_size {
                return Err(StoreError::SizeMismatch {
                    expected: expected_size,
                    actual,
                });
            }

            let artifact = Artifact {
                fingerprint: fingerprint.to_string(),
                file_name: file_name.to_string(),
                file_size: actual,
                merged_at: chrono::Utc::now(),
            };
            self.artifacts
                .insert(fingerprint.to_string(), (artifact.clone(), assembled));
            self.chunk_sets.remove(fingerprint);
            Ok(artifact)
        })
    }

    fn purge_chunks<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.chunk_sets.remove(fingerprint).is_some()) })
    }

    fn stale_chunk_sets(&self, idle: Duration) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            Ok(self
                .chunk_sets
                .iter()
                .filter(|set| set.touched.elapsed() > idle)
                .map(|set| set.key().clone())
                .collect())
        })
    }

    fn list_artifacts(&self) -> StoreFuture<'_, Vec<Artifact>> {
        Box::pin(async move {
            let mut artifacts: Vec<Artifact> = self.artifacts.iter().map(|e| e.value().0.clone()).collect();
            artifacts.sort_by(|a, b| a.merged_at.cmp(&b.merged_at));
            Ok(artifacts)
        })
    }

    fn stats(&self) -> StoreFuture<'_, StatsResponse> {
        Box::pin(async move {
            let mut stats = StatsResponse::default();
            for entry in self.artifacts.iter() {
                stats.artifacts += 1;
                stats.artifact_bytes += entry.value().0.file_size;
            }
            for set in self.chunk_sets.iter() {
                stats.pending_chunk_sets += 1;
                stats.pending_chunks += set.chunks.len();
                stats.pending_bytes += set.chunks.values().map(|c| c.len() as u64).sum::<u64>();
            }
            Ok(stats)
        })
    }
}
