//! Server side of the resumable upload protocol: existence checks, chunk
//! intake and ordered assembly, on top of any [`ChunkStore`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::hashing::chunk_digest;
use crate::models::{Artifact, CheckRequest, CheckResponse, ChunkAck, ChunkMeta, MergeRequest};
use crate::store::ChunkStore;
use crate::utils::sanitize_filename;

const MAX_FINGERPRINT_LEN: usize = 128;

/// upper bound on `totalChunks` accepted from a client
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// fingerprints double as directory names, so only `[A-Za-z0-9_-]` is accepted
pub fn validate_fingerprint(fingerprint: &str) -> Result<(), StoreError> {
    if fingerprint.is_empty() {
        return Err(StoreError::Validation("fileFingerprint is required".to_string()));
    }
    if fingerprint.len() > MAX_FINGERPRINT_LEN
        || !fingerprint
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::Validation(format!("invalid fileFingerprint: {}", fingerprint)));
    }
    Ok(())
}

fn validate_total_chunks(total_chunks: u32) -> Result<(), StoreError> {
    if total_chunks > MAX_TOTAL_CHUNKS {
        return Err(StoreError::Validation(format!(
            "totalChunks {} exceeds the limit of {}",
            total_chunks, MAX_TOTAL_CHUNKS
        )));
    }
    Ok(())
}

fn validate_file_name(file_name: &str) -> Result<String, StoreError> {
    let sanitized = sanitize_filename(file_name);
    if sanitized.is_empty() {
        return Err(StoreError::Validation("fileName is required".to_string()));
    }
    Ok(sanitized)
}

/// coordinates concurrent access to the store per fingerprint.
///
/// chunk writes share a fingerprint's lock, merge/discard/sweep hold it
/// exclusively, so a merge always reads a complete and stable chunk set.
pub struct ChunkAssembler {
    store: Arc<dyn ChunkStore>,
    locks: DashMap<String, Arc<RwLock<()>>>,
    verify_chunk_hash: bool,
}

impl ChunkAssembler {
    pub fn new(store: Arc<dyn ChunkStore>, verify_chunk_hash: bool) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            verify_chunk_hash,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    fn lock_for(&self, fingerprint: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(fingerprint.to_string())
            .or_default()
            .clone()
    }

    // forget a lock nobody else holds or waits on
    fn release_lock(&self, fingerprint: &str) {
        self.locks
            .remove_if(fingerprint, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// report whether a fingerprint is merged, or which chunks are stored
    pub async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, StoreError> {
        validate_fingerprint(&req.file_fingerprint)?;
        let lock = self.lock_for(&req.file_fingerprint);
        let (artifact, indices) = {
            let _guard = lock.read().await;
            match self.store.artifact(&req.file_fingerprint).await? {
                Some(artifact) => (Some(artifact), Vec::new()),
                None => (None, self.store.chunk_indices(&req.file_fingerprint).await?),
            }
        };
        drop(lock);
        self.release_lock(&req.file_fingerprint);

        if let Some(artifact) = artifact {
            tracing::debug!("⚡ Instant upload hit for {} ({})", req.file_fingerprint, artifact.file_name);
            return Ok(CheckResponse {
                exists: true,
                uploaded_chunk_indices: Vec::new(),
                artifact_ref: Some(artifact.artifact_ref()),
            });
        }

        tracing::debug!(
            "Check {} ({}, {} bytes): {} chunks stored",
            req.file_fingerprint,
            req.file_name,
            req.file_size,
            indices.len()
        );
        Ok(CheckResponse {
            exists: false,
            uploaded_chunk_indices: indices,
            artifact_ref: None,
        })
    }

    /// persist one chunk; re-sending an index replaces the earlier payload
    pub async fn receive_chunk(&self, meta: &ChunkMeta, data: Bytes) -> Result<ChunkAck, StoreError> {
        validate_fingerprint(&meta.file_fingerprint)?;
        validate_file_name(&meta.file_name)?;
        validate_total_chunks(meta.total_chunks)?;
        if meta.chunk_index >= meta.total_chunks {
            return Err(StoreError::Validation(format!(
                "chunkIndex {} out of range for totalChunks {}",
                meta.chunk_index, meta.total_chunks
            )));
        }

        if self.verify_chunk_hash {
            if let Some(expected) = meta.chunk_hash.as_deref().filter(|h| !h.is_empty()) {
                let actual = chunk_digest(&data);
                if !actual.eq_ignore_ascii_case(expected) {
                    tracing::warn!("Chunk {} of {} failed hash verification", meta.chunk_index, meta.file_fingerprint);
                    return Err(StoreError::ChunkHashMismatch {
                        index: meta.chunk_index,
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        let size = data.len();
        let lock = self.lock_for(&meta.file_fingerprint);
        let stored = {
            let _guard = lock.read().await;
            // merged fingerprints are final; late chunks are acknowledged and dropped
            if self.store.artifact(&meta.file_fingerprint).await?.is_some() {
                false
            } else {
                self.store
                    .put_chunk(&meta.file_fingerprint, meta.chunk_index, data)
                    .await?;
                true
            }
        };
        drop(lock);
        self.release_lock(&meta.file_fingerprint);

        if stored {
            tracing::debug!(
                "📦 Received chunk {}/{} for {} ({} bytes)",
                meta.chunk_index + 1,
                meta.total_chunks,
                meta.file_fingerprint,
                size
            );
        } else {
            tracing::debug!("Ignoring chunk {} for already merged {}", meta.chunk_index, meta.file_fingerprint);
        }

        Ok(ChunkAck {
            chunk_index: meta.chunk_index,
            uploaded: true,
        })
    }

    /// assemble every chunk of a fingerprint into the final artifact
    pub async fn merge(&self, req: &MergeRequest) -> Result<Artifact, StoreError> {
        validate_fingerprint(&req.file_fingerprint)?;
        let file_name = validate_file_name(&req.file_name)?;
        validate_total_chunks(req.total_chunks)?;
        // every chunk carries at least one byte
        if u64::from(req.total_chunks) > req.file_size {
            return Err(StoreError::Validation(format!(
                "totalChunks {} cannot cover fileSize {}",
                req.total_chunks, req.file_size
            )));
        }

        let lock = self.lock_for(&req.file_fingerprint);
        let result = {
            let _guard = lock.write().await;
            match self.store.artifact(&req.file_fingerprint).await? {
                Some(existing) => {
                    tracing::debug!("Merge for {} already completed", req.file_fingerprint);
                    Ok(existing)
                }
                None => {
                    self.store
                        .assemble(&req.file_fingerprint, &file_name, req.total_chunks, req.file_size)
                        .await
                }
            }
        };
        drop(lock);
        self.release_lock(&req.file_fingerprint);

        match &result {
            Ok(artifact) => tracing::info!(
                "✅ Merged {} chunks into {} ({} bytes)",
                req.total_chunks,
                artifact.artifact_ref(),
                artifact.file_size
            ),
            Err(e) => tracing::warn!("❌ Merge of {} failed: {}", req.file_fingerprint, e),
        }
        result
    }

    /// drop a partial chunk set; merged artifacts are never touched
    pub async fn discard(&self, fingerprint: &str) -> Result<bool, StoreError> {
        validate_fingerprint(fingerprint)?;
        let lock = self.lock_for(fingerprint);
        let removed = {
            let _guard = lock.write().await;
            self.store.purge_chunks(fingerprint).await?
        };
        drop(lock);
        self.release_lock(fingerprint);

        if removed {
            tracing::info!("🗑️  Discarded chunk set {}", fingerprint);
        }
        Ok(removed)
    }

    /// remove chunk sets idle for longer than `ttl`, returning how many went
    pub async fn sweep_stale(&self, ttl: Duration) -> Result<usize, StoreError> {
        let stale = self.store.stale_chunk_sets(ttl).await?;
        let mut removed = 0;
        for fingerprint in stale {
            let lock = self.lock_for(&fingerprint);
            {
                let _guard = lock.write().await;
                // a write may have landed since the scan
                let still_stale = self
                    .store
                    .stale_chunk_sets(ttl)
                    .await?
                    .contains(&fingerprint);
                if still_stale && self.store.purge_chunks(&fingerprint).await? {
                    removed += 1;
                }
            }
            drop(lock);
            self.release_lock(&fingerprint);
        }

        if removed > 0 {
            tracing::info!("🧹 Swept {} abandoned chunk sets", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;

    fn meta(fingerprint: &str, index: u32, total: u32) -> ChunkMeta {
        ChunkMeta {
            file_fingerprint: fingerprint.to_string(),
            file_name: "f.bin".to_string(),
            chunk_index: index,
            chunk_hash: None,
            total_chunks: total,
        }
    }

    fn check_req(fingerprint: &str) -> CheckRequest {
        CheckRequest {
            file_fingerprint: fingerprint.to_string(),
            file_name: "f.bin".to_string(),
            file_size: 6,
        }
    }

    fn merge_req(fingerprint: &str, total: u32, size: u64) -> MergeRequest {
        MergeRequest {
            file_fingerprint: fingerprint.to_string(),
            file_name: "f.bin".to_string(),
            file_size: size,
            total_chunks: total,
        }
    }

    #[test]
    fn test_validate_fingerprint() {
        assert!(validate_fingerprint("5eb63bbbe01eeed093cb22bb8f5acdc3").is_ok());
        assert!(validate_fingerprint("a_b-c").is_ok());
        assert!(validate_fingerprint("").is_err());
        assert!(validate_fingerprint("../etc").is_err());
        assert!(validate_fingerprint(&"a".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_check_reports_partial_then_merged() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = ChunkAssembler::new(store.clone(), true);

        let empty = assembler.check(&check_req("fp")).await.unwrap();
        assert!(!empty.exists);
        assert!(empty.uploaded_chunk_indices.is_empty());

        assembler.receive_chunk(&meta("fp", 2, 3), Bytes::from_static(b"ef")).await.unwrap();
        assembler.receive_chunk(&meta("fp", 0, 3), Bytes::from_static(b"ab")).await.unwrap();
        let partial = assembler.check(&check_req("fp")).await.unwrap();
        assert_eq!(partial.uploaded_chunk_indices, vec![0, 2]);

        assembler.receive_chunk(&meta("fp", 1, 3), Bytes::from_static(b"cd")).await.unwrap();
        let artifact = assembler.merge(&merge_req("fp", 3, 6)).await.unwrap();
        assert_eq!(store.artifact_bytes("fp").unwrap(), Bytes::from_static(b"abcdef"));

        let merged = assembler.check(&check_req("fp")).await.unwrap();
        assert!(merged.exists);
        assert!(merged.uploaded_chunk_indices.is_empty());
        assert_eq!(merged.artifact_ref, Some(artifact.artifact_ref()));
    }

    #[tokio::test]
    async fn test_merged_is_absorbing() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = ChunkAssembler::new(store.clone(), false);
        assembler.receive_chunk(&meta("fp", 0, 1), Bytes::from_static(b"abc")).await.unwrap();
        let first = assembler.merge(&merge_req("fp", 1, 3)).await.unwrap();

        // late chunk is acknowledged but not stored
        let ack = assembler.receive_chunk(&meta("fp", 0, 1), Bytes::from_static(b"zzz")).await.unwrap();
        assert!(ack.uploaded);
        assert!(store.chunk("fp", 0).is_none());

        let again = assembler.merge(&merge_req("fp", 1, 3)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.artifact_bytes("fp").unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_merge_incomplete() {
        let assembler = ChunkAssembler::new(Arc::new(MemoryChunkStore::new()), false);
        assembler.receive_chunk(&meta("fp", 0, 3), Bytes::from_static(b"ab")).await.unwrap();

        let err = assembler.merge(&merge_req("fp", 3, 6)).await.unwrap_err();
        assert!(matches!(err, StoreError::IncompleteChunks { first_missing: 1, missing: 2, total: 3 }));
        assert!(!assembler.check(&check_req("fp")).await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_chunk_hash_verification() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = ChunkAssembler::new(store.clone(), true);

        let mut bad = meta("fp", 0, 1);
        bad.chunk_hash = Some("00000000000000000000000000000000".to_string());
        let err = assembler.receive_chunk(&bad, Bytes::from_static(b"data")).await.unwrap_err();
        assert!(matches!(err, StoreError::ChunkHashMismatch { index: 0, .. }));
        assert!(store.chunk("fp", 0).is_none());

        let mut good = meta("fp", 0, 1);
        good.chunk_hash = Some(chunk_digest(b"data").to_uppercase());
        assembler.receive_chunk(&good, Bytes::from_static(b"data")).await.unwrap();
        assert!(store.chunk("fp", 0).is_some());
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_range() {
        let assembler = ChunkAssembler::new(Arc::new(MemoryChunkStore::new()), false);
        let err = assembler.receive_chunk(&meta("fp", 3, 3), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_merge_rejects_implausible_chunk_totals() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = ChunkAssembler::new(store.clone(), false);

        let err = assembler.merge(&merge_req("fp", u32::MAX, u64::MAX)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        // more chunks than bytes
        let err = assembler.merge(&merge_req("fp", 100_000, 10)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        // a large but plausible total still reports the gap without listing it
        let err = assembler.merge(&merge_req("fp", MAX_TOTAL_CHUNKS, u64::MAX)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::IncompleteChunks { first_missing: 0, missing: MAX_TOTAL_CHUNKS, total: MAX_TOTAL_CHUNKS }
        ));
        assert!(assembler.locks.is_empty());
    }

    #[tokio::test]
    async fn test_receive_chunk_validates_metadata() {
        let assembler = ChunkAssembler::new(Arc::new(MemoryChunkStore::new()), false);

        let mut unnamed = meta("fp", 0, 2);
        unnamed.file_name = "../".to_string();
        let err = assembler.receive_chunk(&unnamed, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let oversized = meta("fp", 0, MAX_TOTAL_CHUNKS + 1);
        let err = assembler.receive_chunk(&oversized, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert!(assembler.store().chunk_indices("fp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_and_sweep() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = ChunkAssembler::new(store.clone(), false);
        assembler.receive_chunk(&meta("a", 0, 2), Bytes::from_static(b"x")).await.unwrap();
        assembler.receive_chunk(&meta("b", 0, 2), Bytes::from_static(b"y")).await.unwrap();

        assert!(assembler.discard("a").await.unwrap());
        assert!(!assembler.discard("a").await.unwrap());

        assert_eq!(assembler.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(assembler.sweep_stale(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(store.chunk_indices("b").await.unwrap().is_empty());
        assert!(assembler.locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_chunk_writes() {
        let store = Arc::new(MemoryChunkStore::new());
        let assembler = Arc::new(ChunkAssembler::new(store.clone(), false));

        let mut tasks = tokio::task::JoinSet::new();
        for index in (0..16u32).rev() {
            let assembler = assembler.clone();
            tasks.spawn(async move {
                assembler
                    .receive_chunk(&meta("fp", index, 16), Bytes::from(vec![index as u8; 4]))
                    .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        assembler.merge(&merge_req("fp", 16, 64)).await.unwrap();
        let bytes = store.artifact_bytes("fp").unwrap();
        for (i, window) in bytes.chunks(4).enumerate() {
            assert!(window.iter().all(|b| *b == i as u8));
        }
    }
}
