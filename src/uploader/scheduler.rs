use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backend::{MediaRegistrar, MessageSender, Peer, ProgressSink, TransferBackend};
use super::item::{ItemSource, UploadItem};
use super::ordering::{Flush, MediaBinding, OrderingBuffer};
use super::pipeline::UploadPipeline;
use super::sender::BatchSender;
use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;

/// Collaborators and knobs for one [`Uploader`]
pub struct UploaderOptions {
    pub transfer: Arc<dyn TransferBackend>,
    pub registrar: Arc<dyn MediaRegistrar>,
    pub sender: Arc<dyn MessageSender>,
    pub progress: Arc<dyn ProgressSink>,
    /// Concurrent part uploads per file
    pub threads: usize,
    /// Concurrent files
    pub limit: usize,
    pub as_album: bool,
    pub max_album_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub session_id: String,
    pub sent: usize,
    pub failed: usize,
}

/// Uploads items concurrently and sends them in source order, flushing a
/// group as soon as a contiguous run of `max_album_size` has completed.
pub struct Uploader {
    pipeline: Arc<UploadPipeline>,
    batch_sender: Arc<BatchSender>,
    progress: Arc<dyn ProgressSink>,
    limit: usize,
    max_album_size: usize,
}

impl Uploader {
    pub fn new(opts: UploaderOptions) -> AppResult<Self> {
        InputValidator::validate_upload_settings(opts.limit, opts.max_album_size, opts.threads)?;

        Ok(Self {
            pipeline: Arc::new(UploadPipeline::new(
                opts.transfer,
                opts.registrar,
                opts.threads,
            )),
            batch_sender: Arc::new(BatchSender::new(
                opts.sender,
                opts.as_album,
                opts.max_album_size,
            )),
            progress: opts.progress,
            limit: opts.limit,
            max_album_size: opts.max_album_size,
        })
    }

    /// Upload everything `source` yields to `peer`.
    ///
    /// Item failures are logged and skipped. On cancellation, whatever
    /// finished uploading is still sent before `UploadCancelled` is returned.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        source: &mut dyn ItemSource,
        peer: Arc<Peer>,
    ) -> AppResult<RunSummary> {
        let session_id = Uuid::new_v4().to_string();
        log::info!(
            "Starting upload session {} to {} (limit {}, album size {})",
            session_id,
            peer.id,
            self.limit,
            self.max_album_size
        );

        // Child token so a fatal send failure can stop the run without
        // touching the caller's token.
        let halt = cancel.child_token();

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState::new(self.max_album_size, flush_tx));
        let sender_task = tokio::spawn(send_flushes(
            self.batch_sender.clone(),
            peer.clone(),
            flush_rx,
            halt.clone(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut workers = JoinSet::new();
        let mut next_index = 0usize;

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if !source.advance(&halt).await {
                break;
            }
            let Some(item) = source.current() else {
                break;
            };

            let index = next_index;
            next_index += 1;

            let pipeline = self.pipeline.clone();
            let progress = self.progress.clone();
            let shared = shared.clone();
            let halt = halt.clone();
            workers.spawn(async move {
                let _permit = permit;
                upload_one(index, item, &pipeline, progress.as_ref(), &shared, &halt).await;
            });
        }

        let mut source_error = None;
        if let Some(err) = source.err() {
            if err.is_cancelled() {
                shared.canceled.store(true, Ordering::SeqCst);
            } else {
                log::error!("Item source failed after {} items: {}", next_index, err);
                source_error = Some(err);
            }
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                log::error!("Upload worker panicked: {}", e);
                shared.failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Everything still buffered goes out, gaps or not.
        shared.drain();

        let report = sender_task
            .await
            .map_err(|e| AppError::Internal(format!("send task failed: {}", e)))?;

        let summary = RunSummary {
            session_id,
            sent: report.sent,
            failed: shared.failed.load(Ordering::SeqCst),
        };

        if let Some(err) = report.error {
            return Err(err);
        }
        if let Some(err) = source_error {
            return Err(AppError::Source(Box::new(err)));
        }
        if shared.canceled.load(Ordering::SeqCst) || cancel.is_cancelled() {
            log::info!(
                "Session {} cancelled with {} items sent",
                summary.session_id,
                summary.sent
            );
            return Err(AppError::upload_cancelled(
                "upload",
                &summary.session_id,
                summary.sent,
            ));
        }

        log::info!(
            "Session {} completed: {} sent, {} failed",
            summary.session_id,
            summary.sent,
            summary.failed
        );
        Ok(summary)
    }
}

async fn upload_one(
    index: usize,
    item: UploadItem,
    pipeline: &UploadPipeline,
    progress: &dyn ProgressSink,
    shared: &SharedState,
    cancel: &CancellationToken,
) {
    progress.on_start(&item);

    let guard = FinishGuard {
        progress,
        item: &item,
        armed: true,
    };
    let result = pipeline.upload(cancel, &item).await;
    guard.disarm();

    match result {
        Ok(media) => {
            progress.on_finish(&item, None);
            shared.complete(MediaBinding { index, item, media });
        }
        Err(e) if e.is_cancelled() => {
            log::debug!("Upload of {} (#{}) cancelled", item.name(), index);
            shared.canceled.store(true, Ordering::SeqCst);
            progress.on_finish(&item, Some(&e));
        }
        Err(e) => {
            if e.is_permanent() {
                log::warn!("Skip file {} (#{}): {}", item.name(), index, e);
            } else {
                log::error!("Error: upload file {} (#{}) failed: {}", item.name(), index, e);
            }
            shared.failed.fetch_add(1, Ordering::SeqCst);
            progress.on_finish(&item, Some(&e));
        }
    }
}

/// Reports a finish for an item whose upload unwound without returning
struct FinishGuard<'a> {
    progress: &'a dyn ProgressSink,
    item: &'a UploadItem,
    armed: bool,
}

impl FinishGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let err = AppError::Internal(format!("upload of {} panicked", self.item.name()));
            self.progress.on_finish(self.item, Some(&err));
        }
    }
}

struct FlushState {
    buffer: OrderingBuffer,
    /// Dropped after the final drain, which ends the send task
    tx: Option<mpsc::UnboundedSender<Flush>>,
}

struct SharedState {
    state: Mutex<FlushState>,
    canceled: AtomicBool,
    failed: AtomicUsize,
}

impl SharedState {
    fn new(max_album_size: usize, tx: mpsc::UnboundedSender<Flush>) -> Self {
        Self {
            state: Mutex::new(FlushState {
                buffer: OrderingBuffer::new(max_album_size),
                tx: Some(tx),
            }),
            canceled: AtomicBool::new(false),
            failed: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("Ordering buffer lock poisoned, continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Buffer a binding and queue a group if one became ready. Queueing
    /// happens under the lock so groups reach the send task in flush order.
    fn complete(&self, binding: MediaBinding) {
        let mut state = self.lock();
        state.buffer.insert(binding);

        if let Some(flush) = state.buffer.take_ready() {
            log::info!(
                "Flushing #{}..=#{} ({} still buffered)",
                flush.first_index().unwrap_or_default(),
                flush.last_index().unwrap_or_default(),
                state.buffer.len()
            );
            queue(&state.tx, flush);
        }
    }

    fn drain(&self) {
        let mut state = self.lock();

        if let Some(flush) = state.buffer.drain() {
            log::info!(
                "Final flush of {} items starting at #{}",
                flush.bindings.len(),
                flush.first_index().unwrap_or_default()
            );
            queue(&state.tx, flush);
        }

        state.tx = None;
    }
}

fn queue(tx: &Option<mpsc::UnboundedSender<Flush>>, flush: Flush) {
    match tx {
        Some(tx) => {
            if tx.send(flush).is_err() {
                log::warn!("Send task is gone, dropping flushed group");
            }
        }
        None => log::warn!("Flush after final drain, dropping group"),
    }
}

#[derive(Default)]
struct SendReport {
    sent: usize,
    error: Option<AppError>,
}

/// Sends flushed groups one at a time. The first failure halts the run and
/// every later group is discarded.
async fn send_flushes(
    batch_sender: Arc<BatchSender>,
    peer: Arc<Peer>,
    mut rx: mpsc::UnboundedReceiver<Flush>,
    halt: CancellationToken,
) -> SendReport {
    let mut report = SendReport::default();

    while let Some(flush) = rx.recv().await {
        if report.error.is_some() {
            log::warn!(
                "Discarding {} uploaded items after earlier send failure",
                flush.bindings.len()
            );
            continue;
        }

        match batch_sender
            .send(&flush.bindings, &peer, flush.has_caption)
            .await
        {
            Ok(()) => report.sent += flush.bindings.len(),
            Err(partial) => {
                log::error!(
                    "Error: send uploaded files failed after {} of {}: {}",
                    partial.sent,
                    flush.bindings.len(),
                    partial.error
                );
                report.sent += partial.sent;
                halt.cancel();
                report.error = Some(partial.error);
            }
        }
    }

    report
}
