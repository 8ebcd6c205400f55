use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use gallery_core::{ImageUpload, ProgressFn, UploadedImage};

use super::compress::Compressor;
use super::transport::{TransferRequest, Transport};
use super::validate::{RejectedFile, SourceFile, ValidationError, validate_batch};
use crate::config::UploadQueueConfig;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Cancelled,
}

/// Local-only preview bytes for rendering the entry before its remote URL
/// exists. Dropped when the entry is removed or the queue is cleared.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    pub bytes: Bytes,
    pub mime_type: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("entry {0} is not in the queue")]
    EntryNotFound(EntryId),
    #[error("entry {0} is not in an error state")]
    NotRetryable(EntryId),
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress { id: EntryId, percent: u8 },
    Completed { id: EntryId, image: UploadedImage },
    Failed { id: EntryId, message: String },
    Cancelled { id: EntryId },
    BatchFinished { completed: usize, failed: usize, cancelled: usize },
}

#[derive(Debug)]
pub struct AddOutcome {
    pub added: Vec<EntryId>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub status: EntryStatus,
    pub progress_percent: u8,
    pub result: Option<UploadedImage>,
    pub error: Option<String>,
    pub preview: Option<PreviewHandle>,
}

struct Entry {
    source: SourceFile,
    status: EntryStatus,
    progress_percent: u8,
    result: Option<UploadedImage>,
    error: Option<String>,
    preview: Option<PreviewHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<EntryId, Entry>,
    order: Vec<EntryId>,
    ready: VecDeque<EntryId>,
    active: usize,
    draining: u32,
}

enum Settlement {
    Done(UploadedImage),
    Failed(String),
    Cancelled,
}

pub struct UploadQueue {
    config: UploadQueueConfig,
    compressor: Option<Arc<dyn Compressor>>,
    events: Option<UnboundedSender<UploadEvent>>,
    inner: Arc<Mutex<QueueInner>>,
}

impl UploadQueue {
    pub fn new(config: UploadQueueConfig) -> Self {
        Self {
            config,
            compressor: None,
            events: None,
            inner: Arc::new(Mutex::new(QueueInner::default())),
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates and registers files, returning the partition before any
    /// network activity. Accepted files become pending entries with a
    /// local preview.
    pub async fn add_files(&self, paths: Vec<PathBuf>) -> AddOutcome {
        let mut sources = Vec::new();
        let mut rejected = Vec::new();
        for path in paths {
            match SourceFile::from_path(&path).await {
                Ok(source) => sources.push(source),
                Err(err) => rejected.push(RejectedFile {
                    source: SourceFile::unreadable(&path),
                    reasons: vec![ValidationError::Unreadable(err.to_string())],
                }),
            }
        }

        let current_count = self.inner.lock().entries.len();
        let validation = validate_batch(sources, current_count, &self.config.validation).await;
        rejected.extend(validation.rejected);

        let mut added = Vec::new();
        for source in validation.accepted {
            let preview = tokio::fs::read(&source.path)
                .await
                .ok()
                .map(|bytes| PreviewHandle {
                    bytes: Bytes::from(bytes),
                    mime_type: source.mime_type.clone(),
                });
            let id = EntryId::next();
            let entry = Entry {
                source,
                status: EntryStatus::Pending,
                progress_percent: 0,
                result: None,
                error: None,
                preview,
                cancel: CancellationToken::new(),
            };
            let mut inner = self.inner.lock();
            inner.entries.insert(id, entry);
            inner.order.push(id);
            added.push(id);
        }
        AddOutcome { added, rejected }
    }

    /// Cancels the entry's transfer if one is running and drops all of its
    /// bookkeeping, preview included.
    pub fn remove_file(&self, id: EntryId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(&id) else {
            return Err(QueueError::EntryNotFound(id));
        };
        entry.cancel.cancel();
        inner.order.retain(|other| *other != id);
        inner.ready.retain(|other| *other != id);
        Ok(())
    }

    /// Drains every entry that was pending when called, starting transfers
    /// FIFO under the concurrency bound. Resolves once all of them are
    /// terminal; one entry's failure never aborts its siblings.
    pub async fn upload_files<T: Transport>(&self, transport: &T) -> BatchOutcome {
        let batch: Vec<EntryId> = {
            let mut inner = self.inner.lock();
            let ids: Vec<EntryId> = inner
                .order
                .iter()
                .copied()
                .filter(|id| {
                    inner
                        .entries
                        .get(id)
                        .is_some_and(|entry| entry.status == EntryStatus::Pending)
                })
                .collect();
            for id in &ids {
                if !inner.ready.contains(id) {
                    inner.ready.push_back(*id);
                }
            }
            ids
        };

        self.drain(transport).await;

        let outcome = {
            let inner = self.inner.lock();
            let mut outcome = BatchOutcome::default();
            for id in &batch {
                match inner.entries.get(id).map(|entry| entry.status) {
                    Some(EntryStatus::Completed) => outcome.completed += 1,
                    Some(EntryStatus::Error) => outcome.failed += 1,
                    // An entry removed mid-batch counts as cancelled.
                    Some(EntryStatus::Cancelled) | None => outcome.cancelled += 1,
                    Some(EntryStatus::Pending) | Some(EntryStatus::Uploading) => {}
                }
            }
            outcome
        };
        log::info!(
            "upload batch finished: {} of {} succeeded",
            outcome.completed,
            batch.len()
        );
        self.emit(UploadEvent::BatchFinished {
            completed: outcome.completed,
            failed: outcome.failed,
            cancelled: outcome.cancelled,
        });
        outcome
    }

    /// Signals the entry's cancellation token and marks it cancelled. A
    /// queued entry simply leaves the ready queue; an in-flight one has its
    /// request aborted, freeing the concurrency slot. Never auto-retried.
    pub fn cancel_upload(&self, id: EntryId) -> Result<(), QueueError> {
        let event = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return Err(QueueError::EntryNotFound(id));
            };
            entry.cancel.cancel();
            if matches!(entry.status, EntryStatus::Pending | EntryStatus::Uploading) {
                entry.status = EntryStatus::Cancelled;
                inner.ready.retain(|other| *other != id);
                Some(UploadEvent::Cancelled { id })
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Puts an errored entry back at the tail of the queue and drains,
    /// unless a drain loop is already running and will pick it up.
    pub async fn retry_upload<T: Transport>(
        &self,
        id: EntryId,
        transport: &T,
    ) -> Result<(), QueueError> {
        let start_drain = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return Err(QueueError::EntryNotFound(id));
            };
            if entry.status != EntryStatus::Error {
                return Err(QueueError::NotRetryable(id));
            }
            entry.status = EntryStatus::Pending;
            entry.error = None;
            entry.progress_percent = 0;
            entry.cancel = CancellationToken::new();
            inner.ready.push_back(id);
            inner.draining == 0
        };
        if start_drain {
            self.drain(transport).await;
        }
        Ok(())
    }

    /// Cancels every in-flight transfer and resets all state. Safe while a
    /// drain is running; its settlements find no entries and do nothing.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.values() {
            entry.cancel.cancel();
        }
        inner.entries.clear();
        inner.order.clear();
        inner.ready.clear();
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|entry| snapshot(*id, entry)))
            .collect()
    }

    pub fn entry(&self, id: EntryId) -> Option<EntrySnapshot> {
        let inner = self.inner.lock();
        inner.entries.get(&id).map(|entry| snapshot(id, entry))
    }

    pub fn pending_count(&self) -> usize {
        self.count_status(EntryStatus::Pending)
    }

    pub fn completed_count(&self) -> usize {
        self.count_status(EntryStatus::Completed)
    }

    pub fn error_count(&self) -> usize {
        self.count_status(EntryStatus::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        !inner.entries.is_empty()
            && inner
                .entries
                .values()
                .all(|entry| entry.status == EntryStatus::Completed)
    }

    async fn drain<T: Transport>(&self, transport: &T) {
        self.inner.lock().draining += 1;
        let max_concurrent = self.config.max_concurrent.max(1);
        let mut in_flight = FuturesUnordered::new();
        loop {
            loop {
                let next = {
                    let mut inner = self.inner.lock();
                    if inner.active >= max_concurrent {
                        None
                    } else {
                        let mut found = None;
                        while let Some(id) = inner.ready.pop_front() {
                            let Some(entry) = inner.entries.get_mut(&id) else {
                                continue;
                            };
                            if entry.status != EntryStatus::Pending {
                                continue;
                            }
                            entry.status = EntryStatus::Uploading;
                            entry.progress_percent = 0;
                            found = Some((id, entry.source.clone(), entry.cancel.clone()));
                            break;
                        }
                        if found.is_some() {
                            inner.active += 1;
                        }
                        found
                    }
                };
                let Some((id, source, cancel)) = next else {
                    break;
                };
                log::debug!("starting upload for entry {id} ({})", source.file_name);
                in_flight.push(self.run_entry(id, source, cancel, transport));
            }
            if in_flight.next().await.is_none() {
                break;
            }
        }
        self.inner.lock().draining -= 1;
    }

    async fn run_entry<T: Transport>(
        &self,
        id: EntryId,
        source: SourceFile,
        cancel: CancellationToken,
        transport: &T,
    ) {
        if cancel.is_cancelled() {
            self.settle(id, Settlement::Cancelled);
            return;
        }
        let bytes = match tokio::fs::read(&source.path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                self.settle(id, Settlement::Failed(format!("file could not be read: {err}")));
                return;
            }
        };
        let bytes = self.maybe_compress(&source, bytes).await;
        let progress = self.progress_reporter(id);
        let request = TransferRequest {
            listing_id: self.config.listing_id.clone(),
            destination: self.config.destination.clone(),
            upload: ImageUpload {
                file_name: source.file_name.clone(),
                mime_type: source.mime_type.clone(),
                bytes,
            },
        };
        match transport.send(request, Some(progress), cancel).await {
            Ok(image) => self.settle(id, Settlement::Done(image)),
            Err(err) if err.is_cancelled() => self.settle(id, Settlement::Cancelled),
            Err(err) => self.settle(id, Settlement::Failed(err.user_message())),
        }
    }

    async fn maybe_compress(&self, source: &SourceFile, bytes: Bytes) -> Bytes {
        let Some(compressor) = &self.compressor else {
            return bytes;
        };
        if (bytes.len() as u64) <= self.config.compress_threshold_bytes {
            return bytes;
        }
        match compressor
            .compress(bytes.clone(), &self.config.compression)
            .await
        {
            Ok(compressed) => compressed,
            Err(err) => {
                log::warn!(
                    "compression failed for {}; uploading the original: {err}",
                    source.file_name
                );
                bytes
            }
        }
    }

    fn progress_reporter(&self, id: EntryId) -> ProgressFn {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        Arc::new(move |percent| {
            let percent = percent.min(100);
            let mut updated = false;
            {
                let mut guard = inner.lock();
                if let Some(entry) = guard.entries.get_mut(&id)
                    && entry.status == EntryStatus::Uploading
                    && percent > entry.progress_percent
                {
                    entry.progress_percent = percent;
                    updated = true;
                }
            }
            if updated && let Some(events) = &events {
                let _ = events.send(UploadEvent::Progress { id, percent });
            }
        })
    }

    fn settle(&self, id: EntryId, settlement: Settlement) {
        let event = {
            let mut inner = self.inner.lock();
            inner.active = inner.active.saturating_sub(1);
            let Some(entry) = inner.entries.get_mut(&id) else {
                // Removed or cleared while in flight.
                return;
            };
            match settlement {
                Settlement::Done(image) => {
                    if entry.status != EntryStatus::Uploading {
                        None
                    } else {
                        entry.status = EntryStatus::Completed;
                        entry.progress_percent = 100;
                        entry.result = Some(image.clone());
                        Some(UploadEvent::Completed { id, image })
                    }
                }
                Settlement::Failed(message) => {
                    if entry.status != EntryStatus::Uploading {
                        None
                    } else {
                        entry.status = EntryStatus::Error;
                        entry.error = Some(message.clone());
                        Some(UploadEvent::Failed { id, message })
                    }
                }
                Settlement::Cancelled => {
                    if entry.status == EntryStatus::Cancelled {
                        None
                    } else {
                        entry.status = EntryStatus::Cancelled;
                        Some(UploadEvent::Cancelled { id })
                    }
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn count_status(&self, status: EntryStatus) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn snapshot(id: EntryId, entry: &Entry) -> EntrySnapshot {
    EntrySnapshot {
        id,
        file_name: entry.source.file_name.clone(),
        byte_size: entry.source.byte_size,
        mime_type: entry.source.mime_type.clone(),
        status: entry.status,
        progress_percent: entry.progress_percent,
        result: entry.result.clone(),
        error: entry.error.clone(),
        preview: entry.preview.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::upload::compress::{CompressError, CompressionOptions};
    use crate::upload::transport::UploadDestination;
    use async_trait::async_trait;
    use gallery_core::ApiError;
    use reqwest::StatusCode;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn bad_request() -> ApiError {
        ApiError::Api {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        }
    }

    #[derive(Default)]
    struct ScriptState {
        active: usize,
        max_active: usize,
        starts: Vec<String>,
        finishes: Vec<String>,
        attempts: HashMap<String, u32>,
        failures: HashMap<String, u32>,
        payload_sizes: HashMap<String, usize>,
        gates: HashMap<String, oneshot::Receiver<()>>,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedTransport {
        fn gate(&self, name: &str) -> oneshot::Sender<()> {
            let (sender, receiver) = oneshot::channel();
            self.state.lock().gates.insert(name.to_string(), receiver);
            sender
        }

        fn fail_times(&self, name: &str, times: u32) {
            self.state.lock().failures.insert(name.to_string(), times);
        }

        fn starts(&self) -> Vec<String> {
            self.state.lock().starts.clone()
        }

        fn max_active(&self) -> usize {
            self.state.lock().max_active
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: TransferRequest,
            progress: Option<ProgressFn>,
            cancel: CancellationToken,
        ) -> Result<UploadedImage, ApiError> {
            let name = request.upload.file_name.clone();
            let gate = {
                let mut state = self.state.lock();
                state.active += 1;
                state.max_active = state.max_active.max(state.active);
                state.starts.push(name.clone());
                *state.attempts.entry(name.clone()).or_insert(0) += 1;
                state
                    .payload_sizes
                    .insert(name.clone(), request.upload.bytes.len());
                state.gates.remove(&name)
            };
            if let Some(gate) = gate {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.state.lock().active -= 1;
                        return Err(ApiError::Cancelled);
                    }
                    _ = gate => {}
                }
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let failed = {
                let mut state = self.state.lock();
                state.active -= 1;
                state.finishes.push(name.clone());
                match state.failures.get_mut(&name) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if failed {
                return Err(bad_request());
            }
            if let Some(progress) = &progress {
                progress(50);
                progress(100);
            }
            Ok(UploadedImage {
                url: format!("https://cdn.example/{name}"),
                public_id: format!("pid-{name}"),
            })
        }
    }

    struct HalvingCompressor;

    #[async_trait]
    impl Compressor for HalvingCompressor {
        async fn compress(
            &self,
            bytes: Bytes,
            _options: &CompressionOptions,
        ) -> Result<Bytes, CompressError> {
            Ok(bytes.slice(0..bytes.len() / 2))
        }
    }

    struct BrokenCompressor;

    #[async_trait]
    impl Compressor for BrokenCompressor {
        async fn compress(
            &self,
            _bytes: Bytes,
            _options: &CompressionOptions,
        ) -> Result<Bytes, CompressError> {
            Err(CompressError("decoder exploded".to_string()))
        }
    }

    fn write_files(dir: &TempDir, names: &[&str], size: usize) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, vec![0u8; size]).unwrap();
                path
            })
            .collect()
    }

    fn test_config(max_concurrent: usize) -> UploadQueueConfig {
        UploadQueueConfig {
            max_concurrent,
            ..UploadQueueConfig::new("listing-1", UploadDestination::Gallery)
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn add_files_partitions_and_registers_pending_entries() {
        let dir = TempDir::new().unwrap();
        let small = write_files(&dir, &["small.jpg"], 512);
        let large = write_files(&dir, &["large.jpg"], 2048);
        let config = UploadQueueConfig {
            validation: ValidationConfig {
                max_bytes: 1024,
                ..ValidationConfig::default()
            },
            ..test_config(3)
        };
        let queue = UploadQueue::new(config);

        let outcome = queue
            .add_files(vec![small[0].clone(), large[0].clone()])
            .await;

        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].source.file_name, "large.jpg");
        assert!(matches!(
            outcome.rejected[0].reasons.as_slice(),
            [ValidationError::TooLarge { limit: 1024, .. }]
        ));

        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Pending);
        assert_eq!(entries[0].progress_percent, 0);
        assert!(entries[0].preview.is_some());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn sequential_queue_starts_entries_in_fifo_order() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg", "c.jpg"], 128);
        let queue = UploadQueue::new(test_config(1));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        let outcome = queue.upload_files(&transport).await;

        assert_eq!(transport.starts(), vec!["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(transport.max_active(), 1);
        assert_eq!(
            outcome,
            BatchOutcome {
                completed: 3,
                failed: 0,
                cancelled: 0
            }
        );
        assert!(queue.is_complete());
        let entry = &queue.entries()[0];
        assert_eq!(entry.progress_percent, 100);
        assert_eq!(
            entry.result.as_ref().unwrap().public_id,
            "pid-a.jpg".to_string()
        );
    }

    #[tokio::test]
    async fn concurrency_bound_is_never_exceeded() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg", "f.jpg"], 64);
        let queue = UploadQueue::new(test_config(3));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        let outcome = queue.upload_files(&transport).await;

        assert_eq!(outcome.completed, 6);
        assert_eq!(transport.max_active(), 3);
    }

    #[tokio::test]
    async fn a_slot_must_free_before_the_next_entry_starts() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg", "c.jpg"], 64);
        let queue = Arc::new(UploadQueue::new(test_config(2)));
        let transport = Arc::new(ScriptedTransport::default());
        let release_a = transport.gate("a.jpg");
        let release_b = transport.gate("b.jpg");

        queue.add_files(paths).await;
        let task = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { queue.upload_files(&*transport).await })
        };

        wait_until("first two entries start", || transport.starts().len() == 2).await;
        assert_eq!(transport.starts(), vec!["a.jpg", "b.jpg"]);

        // Second entry finishes first; the third starts only then.
        release_b.send(()).unwrap();
        wait_until("third entry starts", || transport.starts().len() == 3).await;
        assert_eq!(transport.starts()[2], "c.jpg");
        release_a.send(()).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.completed, 3);
        assert_eq!(transport.max_active(), 2);
        assert!(queue.is_complete());
    }

    #[tokio::test]
    async fn one_failed_entry_never_aborts_its_siblings() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg", "c.jpg"], 64);
        let queue = UploadQueue::new(test_config(2));
        let transport = ScriptedTransport::default();
        transport.fail_times("b.jpg", 1);

        queue.add_files(paths).await;
        let outcome = queue.upload_files(&transport).await;

        assert_eq!(
            outcome,
            BatchOutcome {
                completed: 2,
                failed: 1,
                cancelled: 0
            }
        );
        assert!(!outcome.is_clean());
        assert!(queue.has_errors());
        assert_eq!(queue.error_count(), 1);
        let failed = queue
            .entries()
            .into_iter()
            .find(|entry| entry.status == EntryStatus::Error)
            .unwrap();
        assert_eq!(failed.file_name, "b.jpg");
        assert_eq!(
            failed.error.as_deref(),
            Some("the server rejected the image as invalid input")
        );
    }

    #[tokio::test]
    async fn retry_requeues_an_errored_entry_at_the_tail() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg"], 64);
        let queue = UploadQueue::new(test_config(2));
        let transport = ScriptedTransport::default();
        transport.fail_times("b.jpg", 1);

        queue.add_files(paths).await;
        queue.upload_files(&transport).await;
        assert_eq!(queue.error_count(), 1);

        let failed = queue
            .entries()
            .into_iter()
            .find(|entry| entry.status == EntryStatus::Error)
            .unwrap();
        queue.retry_upload(failed.id, &transport).await.unwrap();

        assert_eq!(queue.error_count(), 0);
        assert!(queue.is_complete());
        assert_eq!(transport.state.lock().attempts["b.jpg"], 2);
    }

    #[tokio::test]
    async fn retry_is_rejected_for_entries_not_in_error_state() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg"], 64);
        let queue = UploadQueue::new(test_config(1));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        queue.upload_files(&transport).await;

        let id = queue.entries()[0].id;
        let err = queue.retry_upload(id, &transport).await.unwrap_err();
        assert!(matches!(err, QueueError::NotRetryable(_)));
    }

    #[tokio::test]
    async fn cancelling_a_queued_entry_keeps_it_from_starting() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg"], 64);
        let queue = Arc::new(UploadQueue::new(test_config(1)));
        let transport = Arc::new(ScriptedTransport::default());
        let release_a = transport.gate("a.jpg");

        queue.add_files(paths).await;
        let ids: Vec<EntryId> = queue.entries().iter().map(|entry| entry.id).collect();
        let task = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { queue.upload_files(&*transport).await })
        };

        wait_until("first entry starts", || !transport.starts().is_empty()).await;
        queue.cancel_upload(ids[1]).unwrap();
        release_a.send(()).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                completed: 1,
                failed: 0,
                cancelled: 1
            }
        );
        assert_eq!(transport.starts(), vec!["a.jpg"]);
        assert_eq!(queue.entry(ids[1]).unwrap().status, EntryStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_an_inflight_entry_frees_its_slot() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg"], 64);
        let queue = Arc::new(UploadQueue::new(test_config(1)));
        let transport = Arc::new(ScriptedTransport::default());
        let _release_a = transport.gate("a.jpg");

        queue.add_files(paths).await;
        let ids: Vec<EntryId> = queue.entries().iter().map(|entry| entry.id).collect();
        let task = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { queue.upload_files(&*transport).await })
        };

        wait_until("first entry starts", || !transport.starts().is_empty()).await;
        queue.cancel_upload(ids[0]).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.cancelled, 1);
        assert_eq!(queue.entry(ids[0]).unwrap().status, EntryStatus::Cancelled);
        assert_eq!(queue.entry(ids[1]).unwrap().status, EntryStatus::Completed);
    }

    #[tokio::test]
    async fn remove_file_drops_all_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg"], 64);
        let queue = UploadQueue::new(test_config(1));

        queue.add_files(paths).await;
        let id = queue.entries()[0].id;
        queue.remove_file(id).unwrap();

        assert!(queue.entries().is_empty());
        assert!(queue.entry(id).is_none());
        assert!(matches!(
            queue.remove_file(id),
            Err(QueueError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_all_is_safe_mid_drain() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg"], 64);
        let queue = Arc::new(UploadQueue::new(test_config(2)));
        let transport = Arc::new(ScriptedTransport::default());
        let _release_a = transport.gate("a.jpg");
        let _release_b = transport.gate("b.jpg");

        queue.add_files(paths).await;
        let task = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { queue.upload_files(&*transport).await })
        };

        wait_until("both entries start", || transport.starts().len() == 2).await;
        queue.clear_all();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.cancelled, 2);
        assert_eq!(outcome.completed, 0);
        assert!(queue.entries().is_empty());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn payload_is_compressed_above_the_threshold() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["big.jpg"], 4096);
        let config = UploadQueueConfig {
            compress_threshold_bytes: 1024,
            ..test_config(1)
        };
        let queue = UploadQueue::new(config).with_compressor(Arc::new(HalvingCompressor));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        queue.upload_files(&transport).await;

        assert_eq!(transport.state.lock().payload_sizes["big.jpg"], 2048);
    }

    #[tokio::test]
    async fn compression_failure_falls_back_to_the_original_bytes() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["big.jpg"], 4096);
        let config = UploadQueueConfig {
            compress_threshold_bytes: 1024,
            ..test_config(1)
        };
        let queue = UploadQueue::new(config).with_compressor(Arc::new(BrokenCompressor));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        let outcome = queue.upload_files(&transport).await;

        assert_eq!(outcome.completed, 1);
        assert_eq!(transport.state.lock().payload_sizes["big.jpg"], 4096);
    }

    #[tokio::test]
    async fn small_payloads_skip_the_compressor() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["small.jpg"], 512);
        let config = UploadQueueConfig {
            compress_threshold_bytes: 1024,
            ..test_config(1)
        };
        let queue = UploadQueue::new(config).with_compressor(Arc::new(HalvingCompressor));
        let transport = ScriptedTransport::default();

        queue.add_files(paths).await;
        queue.upload_files(&transport).await;

        assert_eq!(transport.state.lock().payload_sizes["small.jpg"], 512);
    }

    #[tokio::test]
    async fn events_report_progress_completion_and_the_batch() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.jpg", "b.jpg"], 64);
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let queue = UploadQueue::new(test_config(2)).with_events(sender);
        let transport = ScriptedTransport::default();
        transport.fail_times("b.jpg", 1);

        queue.add_files(paths).await;
        queue.upload_files(&transport).await;

        let mut progress = Vec::new();
        let mut completed = 0;
        let mut failed = 0;
        let mut batch = None;
        while let Ok(event) = receiver.try_recv() {
            match event {
                UploadEvent::Progress { percent, .. } => progress.push(percent),
                UploadEvent::Completed { .. } => completed += 1,
                UploadEvent::Failed { .. } => failed += 1,
                UploadEvent::BatchFinished {
                    completed,
                    failed,
                    cancelled,
                } => batch = Some((completed, failed, cancelled)),
                UploadEvent::Cancelled { .. } => {}
            }
        }
        assert_eq!(progress, vec![50, 100]);
        assert_eq!(completed, 1);
        assert_eq!(failed, 1);
        assert_eq!(batch, Some((1, 1, 0)));
    }

    #[tokio::test]
    async fn upload_files_with_nothing_pending_resolves_immediately() {
        let queue = UploadQueue::new(test_config(2));
        let transport = ScriptedTransport::default();

        let outcome = queue.upload_files(&transport).await;

        assert_eq!(outcome, BatchOutcome::default());
        assert!(transport.starts().is_empty());
    }

    #[tokio::test]
    async fn unreadable_path_is_rejected_with_a_reason() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.jpg");
        let queue = UploadQueue::new(test_config(1));

        let outcome = queue.add_files(vec![missing.clone()]).await;

        assert!(outcome.added.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].source.path, Path::new(&missing));
        assert!(matches!(
            outcome.rejected[0].reasons.as_slice(),
            [ValidationError::Unreadable(_)]
        ));
    }
}
