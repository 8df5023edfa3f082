use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::HashError;
use crate::hashing::{digest_reader, fingerprint_file, DEFAULT_WINDOW};

/// the file being uploaded: a path on disk or a buffer already in memory
#[derive(Debug, Clone)]
pub enum UploadSource {
    File { path: PathBuf, name: String, size: u64 },
    Memory { name: String, data: Bytes },
}

impl UploadSource {
    /// describe a file on disk; the upload name is its file name
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self::File {
            path,
            name,
            size: metadata.len(),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Memory { name, .. } => name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Memory { data, .. } => data.len() as u64,
        }
    }

    /// read bytes `[start, end)`
    pub async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        match self {
            Self::Memory { data, .. } => {
                if end > data.len() as u64 || start > end {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "range beyond buffer"));
                }
                Ok(data.slice(start as usize..end as usize))
            }
            Self::File { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// whole-content MD5, read in windows
    pub async fn fingerprint<F: FnMut(u8)>(&self, on_progress: F) -> Result<String, HashError> {
        match self {
            Self::File { path, .. } => fingerprint_file(path, on_progress).await,
            Self::Memory { data, .. } => {
                digest_reader(&data[..], data.len() as u64, DEFAULT_WINDOW, on_progress).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_and_memory_ranges_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.dat");
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let file = UploadSource::from_path(&path).await.unwrap();
        let memory = UploadSource::from_bytes("sample.dat", content.clone());
        assert_eq!(file.name(), "sample.dat");
        assert_eq!(file.size(), 1000);

        for (start, end) in [(0, 10), (500, 1000), (999, 1000)] {
            let a = file.read_range(start, end).await.unwrap();
            let b = memory.read_range(start, end).await.unwrap();
            assert_eq!(a, b);
            assert_eq!(&a[..], &content[start as usize..end as usize]);
        }

        assert_eq!(
            file.fingerprint(|_| {}).await.unwrap(),
            memory.fingerprint(|_| {}).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UploadSource::from_path(dir.path()).await.is_err());
    }
}
