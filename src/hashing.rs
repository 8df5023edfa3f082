//! Streaming MD5 content hashing.
//!
//! Input is read in fixed windows (independent of the upload chunk size) and
//! fed into a running digest, so a file is never held in memory at once.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::HashError;

/// default read window (2 MiB)
pub const DEFAULT_WINDOW: usize = 2 * 1024 * 1024;

/// hex MD5 of a buffer already in memory (used for per-chunk hashes)
pub fn chunk_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// hash `total_len` bytes from `reader` window by window.
///
/// `on_progress` receives a percentage after every consumed window. Any read
/// failure aborts the whole computation; no partial digest is returned.
pub async fn digest_reader<R, F>(
    mut reader: R,
    total_len: u64,
    window: usize,
    mut on_progress: F,
) -> Result<String, HashError>
where
    R: AsyncRead + Unpin,
    F: FnMut(u8),
{
    let window = window.max(1);
    let total_windows = total_len.div_ceil(window as u64).max(1);
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; window];
    let mut consumed = 0u64;
    let mut window_index = 0u64;

    while consumed < total_len {
        let want = (total_len - consumed).min(window as u64) as usize;
        reader
            .read_exact(&mut buf[..want])
            .await
            .map_err(|source| HashError::Read {
                window: window_index,
                source,
            })?;
        context.consume(&buf[..want]);
        consumed += want as u64;
        window_index += 1;

        let percent = (window_index * 100 / total_windows).min(100) as u8;
        tracing::trace!("hashed window {}/{} ({}%)", window_index, total_windows, percent);
        on_progress(percent);
    }

    if total_len == 0 {
        on_progress(100);
    }

    Ok(format!("{:x}", context.compute()))
}

/// fingerprint a file on disk
pub async fn fingerprint_file<F>(path: &Path, on_progress: F) -> Result<String, HashError>
where
    F: FnMut(u8),
{
    let open_err = |source| HashError::Open {
        path: path.display().to_string(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(open_err)?;
    let len = file.metadata().await.map_err(open_err)?.len();

    tracing::debug!("Fingerprinting {:?} ({} bytes)", path, len);
    digest_reader(file, len, DEFAULT_WINDOW, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    // yields `ok_bytes` zeros, then fails every read
    struct FailingReader {
        ok_bytes: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.ok_bytes == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk gone")));
            }
            let n = self.ok_bytes.min(buf.remaining());
            buf.put_slice(&vec![0u8; n]);
            self.ok_bytes -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_windowed_digest_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut seen = Vec::new();
        let digest = digest_reader(&data[..], data.len() as u64, 3000, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(digest, chunk_digest(&data));
        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_known_md5() {
        let digest = digest_reader(&b"hello world"[..], 11, 4, |_| {}).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_read_failure_aborts() {
        let reader = FailingReader { ok_bytes: 8 };
        let result = digest_reader(reader, 32, 8, |_| {}).await;
        match result {
            Err(HashError::Read { window, .. }) => assert_eq!(window, 1),
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = fingerprint_file(&path, |_| {}).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let missing = fingerprint_file(&dir.path().join("nope"), |_| {}).await;
        assert!(matches!(missing, Err(HashError::Open { .. })));
    }
}
