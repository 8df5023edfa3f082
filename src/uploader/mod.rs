//! Client-side upload orchestration.
//!
//! An [`Uploader`] splits its source into chunks, asks the server what it
//! already holds, pushes the missing chunks through a bounded pool of
//! transfers and finally requests the merge. `start()` resolves with the
//! terminal result; progress and state changes are reported as
//! [`UploadEvent`]s. `pause()` and `cancel()` abort in-flight transfers
//! instead of waiting for them.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::UploadError;
use crate::hashing::chunk_digest;
use crate::models::{CheckRequest, ChunkMeta, MergeRequest};
use crate::plan::{partition, ChunkDescriptor, DEFAULT_CHUNK_SIZE};
use crate::transport::UploadTransport;

mod source;

pub use source::UploadSource;

/// lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadState {
    Idle,
    Checking,
    Uploading,
    Paused,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    /// states in which a `start()` call is still driving the session
    pub fn is_active(self) -> bool {
        matches!(self, Self::Checking | Self::Uploading | Self::Paused | Self::Merging)
    }
}

/// chunking and admission settings
#[derive(Debug, Clone)]
pub struct UploaderOptions {
    pub chunk_size: u64,
    /// max chunk transfers outstanding at once
    pub concurrency: usize,
    /// attach a per-chunk MD5 for server-side verification
    pub chunk_hash: bool,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            chunk_hash: true,
        }
    }
}

impl From<&ClientConfig> for UploaderOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            concurrency: config.concurrency,
            chunk_hash: config.chunk_hash,
        }
    }
}

/// where the uploaded file ended up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub artifact_ref: String,
    pub file_name: String,
    pub file_size: u64,
    /// the server already had this content; nothing was transferred
    pub instant: bool,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    StateChanged(UploadState),
    /// whole-file fingerprint progress
    Hashing { percent: u8 },
    Progress { percent: u8, uploaded: usize, total: usize },
    ChunkFailed { index: u32, error: String },
    Completed(UploadOutcome),
    Failed(String),
}

// how one chunk transfer ended
enum ChunkOutcome {
    Acked,
    Aborted,
    Failed(String),
}

// pause flag and the token shared by the current generation of transfers,
// guarded together so no transfer starts with a token a pause already replaced
struct TransferControl {
    paused: bool,
    token: CancellationToken,
}

#[derive(Default)]
struct Bookkeeping {
    uploaded: BTreeSet<u32>,
    last_percent: u8,
}

struct Inner {
    source: UploadSource,
    transport: Arc<dyn UploadTransport>,
    options: UploaderOptions,
    fingerprint: OnceCell<String>,
    state: watch::Sender<UploadState>,
    resume_signal: watch::Sender<bool>,
    cancel: CancellationToken,
    control: Mutex<TransferControl>,
    book: Mutex<Bookkeeping>,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
}

/// handle to one upload session; clones share the session
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    pub fn new(source: UploadSource, transport: Arc<dyn UploadTransport>, options: UploaderOptions) -> Self {
        let (state, _) = watch::channel(UploadState::Idle);
        let (resume_signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                source,
                transport,
                options,
                fingerprint: OnceCell::new(),
                state,
                resume_signal,
                cancel: CancellationToken::new(),
                control: Mutex::new(TransferControl {
                    paused: false,
                    token: CancellationToken::new(),
                }),
                book: Mutex::new(Bookkeeping::default()),
                events: None,
            }),
        }
    }

    /// use a precomputed fingerprint instead of hashing the source on start
    pub fn with_fingerprint(self, fingerprint: impl Into<String>) -> Self {
        self.rebuild(|inner| inner.fingerprint = OnceCell::new_with(Some(fingerprint.into())))
    }

    pub fn with_events(self, events: mpsc::UnboundedSender<UploadEvent>) -> Self {
        self.rebuild(|inner| inner.events = Some(events))
    }

    // builder helpers only run before the handle is shared
    fn rebuild(self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self { inner: Arc::new(inner) }
            }
            Err(inner) => {
                tracing::warn!("Uploader already shared; builder option ignored");
                Self { inner }
            }
        }
    }

    pub fn state(&self) -> UploadState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UploadState> {
        self.inner.state.subscribe()
    }

    /// fingerprint, once known
    pub fn fingerprint(&self) -> Option<String> {
        self.inner.fingerprint.get().cloned()
    }

    /// chunk indices acknowledged by the server so far
    pub fn uploaded_indices(&self) -> Vec<u32> {
        self.inner.book.lock().uploaded.iter().copied().collect()
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }

    // move to `to` if `allowed` accepts the current state
    fn transition(&self, allowed: impl Fn(UploadState) -> bool, to: UploadState) -> Result<(), UploadState> {
        let mut from = UploadState::Idle;
        let changed = self.inner.state.send_if_modified(|state| {
            from = *state;
            if allowed(*state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!("Upload {}: {:?} -> {:?}", self.inner.source.name(), from, to);
            self.emit(UploadEvent::StateChanged(to));
            Ok(())
        } else {
            Err(from)
        }
    }

    // forward transitions never override a cancellation
    fn advance(&self, to: UploadState) -> Result<(), UploadError> {
        match self.transition(|s| s.is_active(), to) {
            Ok(()) => Ok(()),
            Err(UploadState::Cancelled) => Err(UploadError::Cancelled),
            Err(state) => Err(UploadError::InvalidState { operation: "advance", state }),
        }
    }

    /// run the session to completion: check, upload missing chunks, merge.
    ///
    /// Valid from `Idle`, `Failed` or `Completed`. Chunks the server already
    /// holds are never re-sent; a fully merged fingerprint completes at once.
    pub async fn start(&self) -> Result<UploadOutcome, UploadError> {
        self.transition(
            |s| matches!(s, UploadState::Idle | UploadState::Failed | UploadState::Completed),
            UploadState::Checking,
        )
        .map_err(|state| UploadError::InvalidState { operation: "start", state })?;

        match self.run().await {
            Ok(outcome) => {
                let _ = self.transition(|s| s.is_active(), UploadState::Completed);
                tracing::info!("✅ Uploaded {} -> {}", outcome.file_name, outcome.artifact_ref);
                self.emit(UploadEvent::Completed(outcome.clone()));
                Ok(outcome)
            }
            Err(UploadError::Cancelled) => {
                tracing::info!("Upload of {} cancelled", self.inner.source.name());
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                let _ = self.transition(|s| s.is_active(), UploadState::Failed);
                tracing::warn!("❌ Upload of {} failed: {}", self.inner.source.name(), e);
                self.emit(UploadEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// start again unless a run is already in progress (`Ok(None)` then)
    pub async fn retry_failed(&self) -> Result<Option<UploadOutcome>, UploadError> {
        if self.state().is_active() {
            tracing::debug!("Retry ignored; upload already running");
            return Ok(None);
        }
        self.start().await.map(Some)
    }

    /// stop starting chunks and abort those in flight; pending chunks are kept
    pub fn pause(&self) -> Result<(), UploadError> {
        let mut control = self.inner.control.lock();
        self.transition(|s| s == UploadState::Uploading, UploadState::Paused)
            .map_err(|state| UploadError::InvalidState { operation: "pause", state })?;
        control.paused = true;
        let aborted = std::mem::replace(&mut control.token, CancellationToken::new());
        aborted.cancel();
        Ok(())
    }

    /// continue a paused upload from its preserved queue
    pub fn resume(&self) -> Result<(), UploadError> {
        let mut control = self.inner.control.lock();
        self.transition(|s| s == UploadState::Paused, UploadState::Uploading)
            .map_err(|state| UploadError::InvalidState { operation: "resume", state })?;
        control.paused = false;
        drop(control);
        self.inner.resume_signal.send_replace(true);
        Ok(())
    }

    /// terminate the session and abort every transfer. Chunks the server
    /// already stored stay there for a later session with the same fingerprint.
    pub fn cancel(&self) {
        if self
            .transition(|s| s != UploadState::Completed && s != UploadState::Cancelled, UploadState::Cancelled)
            .is_err()
        {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.control.lock().token.cancel();
        self.inner.resume_signal.send_replace(true);
    }

    async fn cancellable<T, E>(
        &self,
        fut: impl std::future::Future<Output = Result<T, E>>,
        wrap: impl FnOnce(E) -> UploadError,
    ) -> Result<T, UploadError> {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(UploadError::Cancelled),
            res = fut => res.map_err(wrap),
        }
    }

    async fn run(&self) -> Result<UploadOutcome, UploadError> {
        let source = &self.inner.source;
        let chunks = partition(source.size(), self.inner.options.chunk_size)?;
        let total = chunks.len();

        let fingerprint = self
            .cancellable(
                self.inner.fingerprint.get_or_try_init(|| {
                    source.fingerprint(|percent| self.emit(UploadEvent::Hashing { percent }))
                }),
                UploadError::Hash,
            )
            .await?
            .clone();

        let check = CheckRequest {
            file_fingerprint: fingerprint.clone(),
            file_name: source.name().to_string(),
            file_size: source.size(),
        };
        let existing = self
            .cancellable(self.inner.transport.check(&check), UploadError::Check)
            .await?;

        if existing.exists {
            tracing::info!("⚡ {} already on server, skipping transfer", source.name());
            {
                let mut book = self.inner.book.lock();
                book.uploaded = (0..total as u32).collect();
            }
            self.report_progress(total);
            return Ok(UploadOutcome {
                artifact_ref: existing
                    .artifact_ref
                    .unwrap_or_else(|| format!("/files/{}/{}", fingerprint, source.name())),
                file_name: source.name().to_string(),
                file_size: source.size(),
                instant: true,
            });
        }

        // the server's view is authoritative for what still needs sending
        {
            let mut book = self.inner.book.lock();
            book.uploaded = existing
                .uploaded_chunk_indices
                .iter()
                .copied()
                .filter(|i| (*i as usize) < total)
                .collect();
            tracing::debug!("Resuming {} with {}/{} chunks on server", source.name(), book.uploaded.len(), total);
        }
        self.report_progress(total);

        self.advance(UploadState::Uploading)?;
        self.upload_all_chunks(&chunks, &fingerprint).await?;

        let uploaded = self.inner.book.lock().uploaded.len();
        if uploaded != total {
            return Err(UploadError::IncompleteUpload { uploaded, total });
        }

        self.advance(UploadState::Merging)?;
        let merge = MergeRequest {
            file_fingerprint: fingerprint,
            file_name: source.name().to_string(),
            file_size: source.size(),
            total_chunks: total as u32,
        };
        let merged = self
            .cancellable(self.inner.transport.merge(&merge), UploadError::Merge)
            .await?;

        Ok(UploadOutcome {
            artifact_ref: merged.artifact_ref,
            file_name: merged.file_name,
            file_size: merged.file_size,
            instant: false,
        })
    }

    // bounded worker pool over the chunks not yet acknowledged
    async fn upload_all_chunks(&self, chunks: &[ChunkDescriptor], fingerprint: &str) -> Result<(), UploadError> {
        let total = chunks.len();
        let limit = self.inner.options.concurrency.max(1);
        let mut queue: VecDeque<ChunkDescriptor> = {
            let book = self.inner.book.lock();
            chunks
                .iter()
                .filter(|c| !book.uploaded.contains(&c.index))
                .copied()
                .collect()
        };
        let mut in_flight: JoinSet<(ChunkDescriptor, ChunkOutcome)> = JoinSet::new();
        let mut resume_rx = self.inner.resume_signal.subscribe();

        tracing::debug!("Uploading {} of {} chunks, {} at a time", queue.len(), total, limit);

        loop {
            if self.inner.cancel.is_cancelled() {
                in_flight.abort_all();
                return Err(UploadError::Cancelled);
            }

            // mark resume signals seen before reading the flag, so none is missed
            resume_rx.borrow_and_update();

            // refill under the control lock so a concurrent pause sees every transfer
            let paused = {
                let control = self.inner.control.lock();
                if !control.paused {
                    while in_flight.len() < limit {
                        let Some(chunk) = queue.pop_front() else { break };
                        in_flight.spawn(self.transfer(chunk, fingerprint.to_string(), total as u32, control.token.clone()));
                    }
                }
                control.paused
            };

            if in_flight.is_empty() {
                if !paused {
                    break;
                }
                // nothing running while paused: wait for resume or cancel
                tokio::select! {
                    _ = resume_rx.changed() => {}
                    _ = self.inner.cancel.cancelled() => {}
                }
                continue;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok((chunk, outcome))) => self.settle(chunk, outcome, &mut queue, total),
                    Some(Err(e)) => tracing::error!("Chunk task failed: {}", e),
                    None => {}
                },
                _ = self.inner.cancel.cancelled() => {}
            }
        }

        Ok(())
    }

    fn settle(&self, chunk: ChunkDescriptor, outcome: ChunkOutcome, queue: &mut VecDeque<ChunkDescriptor>, total: usize) {
        match outcome {
            ChunkOutcome::Acked => {
                self.inner.book.lock().uploaded.insert(chunk.index);
                self.report_progress(total);
            }
            ChunkOutcome::Aborted => {
                tracing::debug!("Chunk {} aborted, back in queue", chunk.index);
                queue.push_front(chunk);
            }
            ChunkOutcome::Failed(error) => {
                tracing::warn!("Chunk {} failed: {}", chunk.index, error);
                self.emit(UploadEvent::ChunkFailed { index: chunk.index, error });
            }
        }
    }

    // one chunk transfer, racing the generation token
    fn transfer(
        &self,
        chunk: ChunkDescriptor,
        fingerprint: String,
        total_chunks: u32,
        token: CancellationToken,
    ) -> impl std::future::Future<Output = (ChunkDescriptor, ChunkOutcome)> + Send + 'static {
        let source = self.inner.source.clone();
        let transport = self.inner.transport.clone();
        let with_hash = self.inner.options.chunk_hash;

        async move {
            let send = async {
                let data = source
                    .read_range(chunk.start, chunk.end)
                    .await
                    .map_err(|e| format!("read failed: {}", e))?;
                let meta = ChunkMeta {
                    file_fingerprint: fingerprint,
                    file_name: source.name().to_string(),
                    chunk_index: chunk.index,
                    chunk_hash: with_hash.then(|| chunk_digest(&data)),
                    total_chunks,
                };
                send_chunk(transport.as_ref(), &meta, data).await
            };

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => ChunkOutcome::Aborted,
                res = send => match res {
                    Ok(()) => ChunkOutcome::Acked,
                    Err(e) => ChunkOutcome::Failed(e),
                },
            };
            (chunk, outcome)
        }
    }

    fn report_progress(&self, total: usize) {
        let (percent, uploaded) = {
            let mut book = self.inner.book.lock();
            let uploaded = book.uploaded.len();
            let percent = if total == 0 { 100 } else { (uploaded * 100 / total) as u8 };
            // never report going backwards within a session
            book.last_percent = book.last_percent.max(percent);
            (book.last_percent, uploaded)
        };
        self.emit(UploadEvent::Progress { percent, uploaded, total });
    }
}

async fn send_chunk(transport: &dyn UploadTransport, meta: &ChunkMeta, data: Bytes) -> Result<(), String> {
    match transport.upload_chunk(meta, data).await {
        Ok(ack) if ack.uploaded && ack.chunk_index == meta.chunk_index => Ok(()),
        Ok(ack) => Err(format!("unexpected acknowledgement for chunk {}", ack.chunk_index)),
        Err(e) => Err(e.to_string()),
    }
}
