use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{ensure_complete, ChunkStore, StoreFuture};
use crate::error::StoreError;
use crate::models::{Artifact, StatsResponse};

const CHUNK_PREFIX: &str = "chunk-";

/// filesystem-backed store.
///
/// layout under `root`:
/// - `chunks/<fingerprint>/chunk-<index>` pending chunk payloads
/// - `files/<fingerprint>/<file name>` merged artifacts (served publicly)
/// - `manifests/<fingerprint>.json` artifact records
/// - `tmp/` staging area for atomic writes
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    /// open a store rooted at `root`, creating its directories
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        for dir in ["chunks", "files", "manifests", "tmp"] {
            fs::create_dir_all(store.root.join(dir)).await?;
        }
        tracing::debug!("Opened chunk store at {:?}", store.root);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// directory holding merged artifacts
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    fn chunks_root(&self) -> PathBuf {
        self.root.join("chunks")
    }

    fn chunk_dir(&self, fingerprint: &str) -> PathBuf {
        self.chunks_root().join(fingerprint)
    }

    fn manifest_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join("manifests").join(format!("{}.json", fingerprint))
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join("tmp").join(format!("{}.part", Uuid::new_v4()))
    }

    // write through a staging file and rename, so readers never see half a payload
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), StoreError> {
        let staging = self.staging_path();
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&staging, target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_manifest(&self, fingerprint: &str) -> Result<Option<Artifact>, StoreError> {
        let raw = match fs::read(self.manifest_path(fingerprint)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Manifest {
                fingerprint: fingerprint.to_string(),
                source,
            })
    }

    async fn list_indices(&self, fingerprint: &str) -> Result<Vec<u32>, StoreError> {
        let mut entries = match fs::read_dir(self.chunk_dir(fingerprint)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHUNK_PREFIX))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    // concatenate chunk files into a staging file, returning its path and length
    async fn concat_chunks(&self, fingerprint: &str, total_chunks: u32) -> Result<(PathBuf, u64), StoreError> {
        let staging = self.staging_path();
        let result = async {
            let mut out = fs::File::create(&staging).await?;
            let mut written = 0u64;
            let chunk_dir = self.chunk_dir(fingerprint);
            for index in 0..total_chunks {
                let chunk_path = chunk_dir.join(format!("{}{}", CHUNK_PREFIX, index));
                tracing::trace!("Appending chunk: {:?}", chunk_path);
                let mut chunk = fs::File::open(&chunk_path).await?;
                written += tokio::io::copy(&mut chunk, &mut out).await?;
            }
            out.sync_all().await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => Ok((staging, written)),
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e.into())
            }
        }
    }
}

impl ChunkStore for FsChunkStore {
    fn artifact<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<Artifact>> {
        Box::pin(self.read_manifest(fingerprint))
    }

    fn chunk_indices<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Vec<u32>> {
        Box::pin(self.list_indices(fingerprint))
    }

    fn put_chunk<'a>(&'a self, fingerprint: &'a str, index: u32, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let chunk_dir = self.chunk_dir(fingerprint);
            fs::create_dir_all(&chunk_dir).await?;
            let target = chunk_dir.join(format!("{}{}", CHUNK_PREFIX, index));
            self.write_atomic(&target, &data).await?;
            tracing::trace!("Stored chunk {} of {} ({} bytes)", index, fingerprint, data.len());
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
            let present = self.list_indices(fingerprint).await?;
            ensure_complete(&present, total_chunks)?;

            let (staging, written) = self.concat_chunks(fingerprint, total_chunks).await?;
            if written != expected_size {
                let _ = fs::remove_file(&staging).await;
                return Err(StoreError::SizeMismatch {
                    expected: expected_size,
                    actual: written,
                });
            }

            let artifact_dir = self.files_dir().join(fingerprint);
            fs::create_dir_all(&artifact_dir).await?;
            let final_path = artifact_dir.join(file_name);
            if let Err(e) = fs::rename(&staging, &final_path).await {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }

            let artifact = Artifact {
                fingerprint: fingerprint.to_string(),
                file_name: file_name.to_string(),
                file_size: written,
                merged_at: chrono::Utc::now(),
            };
            let manifest = serde_json::to_vec_pretty(&artifact).map_err(|source| StoreError::Manifest {
                fingerprint: fingerprint.to_string(),
                source,
            })?;
            self.write_atomic(&self.manifest_path(fingerprint), &manifest).await?;

            // the artifact is committed; leftover chunks are only wasted space
            if let Err(e) = fs::remove_dir_all(self.chunk_dir(fingerprint)).await {
                tracing::warn!("Failed to remove chunks of {}: {}", fingerprint, e);
            }

            Ok(artifact)
        })
    }

    fn purge_chunks<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match fs::remove_dir_all(self.chunk_dir(fingerprint)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn stale_chunk_sets(&self, idle: Duration) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut stale = Vec::new();
            let mut entries = fs::read_dir(self.chunks_root()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if !metadata.is_dir() {
                    continue;
                }
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age > idle {
                    stale.push(entry.file_name().to_string_lossy().to_string());
                }
            }
            Ok(stale)
        })
    }

    fn list_artifacts(&self) -> StoreFuture<'_, Vec<Artifact>> {
        Box::pin(async move {
            let mut artifacts = Vec::new();
            let mut entries = fs::read_dir(self.root.join("manifests")).await?;
            while let Some(entry) = entries.next_entry().await? {
                let raw = fs::read(entry.path()).await?;
                match serde_json::from_slice::<Artifact>(&raw) {
                    Ok(artifact) => artifacts.push(artifact),
                    Err(e) => tracing::warn!("Skipping unreadable manifest {:?}: {}", entry.path(), e),
                }
            }
            artifacts.sort_by(|a, b| a.merged_at.cmp(&b.merged_at));
            Ok(artifacts)
        })
    }

    fn stats(&self) -> StoreFuture<'_, StatsResponse> {
        Box::pin(async move {
            let artifacts = self.list_artifacts().await?;
            let mut stats = StatsResponse {
                artifacts: artifacts.len(),
                artifact_bytes: artifacts.iter().map(|a| a.file_size).sum(),
                ..Default::default()
            };

            let mut sets = fs::read_dir(self.chunks_root()).await?;
            while let Some(set) = sets.next_entry().await? {
                if !set.metadata().await?.is_dir() {
                    continue;
                }
                stats.pending_chunk_sets += 1;
                let mut chunks = fs::read_dir(set.path()).await?;
                while let Some(chunk) = chunks.next_entry().await? {
                    stats.pending_chunks += 1;
                    stats.pending_bytes += chunk.metadata().await?.len();
                }
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_chunk_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();

        store.put_chunk("abc", 0, Bytes::from_static(b"first")).await.unwrap();
        store.put_chunk("abc", 0, Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(store.chunk_indices("abc").await.unwrap(), vec![0]);
        let stored = std::fs::read(dir.path().join("chunks/abc/chunk-0")).unwrap();
        assert_eq!(stored, b"second");
        // no staging leftovers
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_assemble_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();

        store.put_chunk("fp", 2, Bytes::from_static(b"!")).await.unwrap();
        store.put_chunk("fp", 0, Bytes::from_static(b"hello ")).await.unwrap();
        store.put_chunk("fp", 1, Bytes::from_static(b"world")).await.unwrap();

        let artifact = store.assemble("fp", "greeting.txt", 3, 12).await.unwrap();
        assert_eq!(artifact.file_size, 12);
        assert_eq!(artifact.artifact_ref(), "/files/fp/greeting.txt");

        let content = std::fs::read_to_string(dir.path().join("files/fp/greeting.txt")).unwrap();
        assert_eq!(content, "hello world!");
        assert!(!dir.path().join("chunks/fp").exists());
        assert_eq!(store.artifact("fp").await.unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn test_assemble_incomplete_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();
        store.put_chunk("fp", 0, Bytes::from_static(b"aa")).await.unwrap();
        store.put_chunk("fp", 2, Bytes::from_static(b"cc")).await.unwrap();

        let err = store.assemble("fp", "x.bin", 3, 6).await.unwrap_err();
        match err {
            StoreError::IncompleteChunks { first_missing, missing, total } => {
                assert_eq!(first_missing, 1);
                assert_eq!(missing, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dir.path().join("files/fp").exists());
        assert!(store.artifact("fp").await.unwrap().is_none());
        assert_eq!(store.chunk_indices("fp").await.unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_assemble_size_mismatch_keeps_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();
        store.put_chunk("fp", 0, Bytes::from_static(b"abcd")).await.unwrap();

        let err = store.assemble("fp", "x.bin", 1, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::SizeMismatch { expected: 5, actual: 4 }));
        assert!(store.artifact("fp").await.unwrap().is_none());
        assert_eq!(store.chunk_indices("fp").await.unwrap(), vec![0]);
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();
        store.put_chunk("old", 0, Bytes::from_static(b"x")).await.unwrap();

        assert!(store.stale_chunk_sets(Duration::from_secs(3600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.stale_chunk_sets(Duration::from_millis(1)).await.unwrap(),
            vec!["old".to_string()]
        );

        assert!(store.purge_chunks("old").await.unwrap());
        assert!(!store.purge_chunks("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path()).await.unwrap();
        store.put_chunk("a", 0, Bytes::from_static(b"12345")).await.unwrap();
        store.put_chunk("b", 0, Bytes::from_static(b"123")).await.unwrap();
        store.put_chunk("b", 1, Bytes::from_static(b"45")).await.unwrap();
        store.assemble("b", "b.bin", 2, 5).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.artifacts, 1);
        assert_eq!(stats.artifact_bytes, 5);
        assert_eq!(stats.pending_chunk_sets, 1);
        assert_eq!(stats.pending_chunks, 1);
        assert_eq!(stats.pending_bytes, 5);
    }
}
