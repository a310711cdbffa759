use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use album_uploader::errors::{AppError, AppResult};
use album_uploader::uploader::{
    Blob, InputMedia, ItemSource, MediaRef, MediaRegistrar, MessageSender, NoProgress, Peer,
    ProgressSink, RemoteFile, TransferBackend, UploadItem, Uploader, UploaderOptions, VecSource,
};

/// End-to-end scheduler tests against an in-memory backend

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Single { id: String, caption: String },
    Group { ids: Vec<String>, caption: Option<String> },
}

impl Sent {
    fn ids(&self) -> Vec<String> {
        match self {
            Sent::Single { id, .. } => vec![id.clone()],
            Sent::Group { ids, .. } => ids.clone(),
        }
    }
}

#[derive(Default)]
struct MockBackend {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    fail_sends: bool,
    send_attempts: AtomicUsize,
    sent: Mutex<Vec<Sent>>,
    events: Mutex<Vec<String>>,
}

impl MockBackend {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_ids(&self) -> Vec<String> {
        self.sent().iter().flat_map(Sent::ids).collect()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferBackend for MockBackend {
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        blob: &Blob,
        _threads: usize,
        _part_size: usize,
    ) -> AppResult<RemoteFile> {
        let delay = self.delays.get(&blob.name).copied().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(AppError::cancelled("transfer")),
        }

        if self.panicking.contains(&blob.name) {
            panic!("transfer of {} blew up", blob.name);
        }

        self.events.lock().unwrap().push(format!("done:{}", blob.name));

        if self.failing.contains(&blob.name) {
            return Err(AppError::upload_failed(format!("HTTP 500 for {}", blob.name)));
        }

        Ok(RemoteFile {
            id: blob.name.clone(),
            parts: 1,
            name: blob.name.clone(),
            size: blob.size,
        })
    }
}

#[async_trait]
impl MediaRegistrar for MockBackend {
    async fn register(
        &self,
        _cancel: &CancellationToken,
        _peer: &Peer,
        media: InputMedia,
    ) -> AppResult<MediaRef> {
        let kind = media.kind();
        let id = match media {
            InputMedia::Photo { file } => file.id,
            InputMedia::Document { file, .. } => file.id,
        };
        Ok(MediaRef { id, kind })
    }
}

#[async_trait]
impl MessageSender for MockBackend {
    async fn send_single(&self, _peer: &Peer, media: &MediaRef, caption: &str) -> AppResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends {
            return Err(AppError::upload_failed("chat is read-only"));
        }
        self.events.lock().unwrap().push(format!("send:{}", media.id));
        self.sent.lock().unwrap().push(Sent::Single {
            id: media.id.clone(),
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn send_group(
        &self,
        _peer: &Peer,
        media: &[MediaRef],
        first_caption: Option<&str>,
    ) -> AppResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends {
            return Err(AppError::upload_failed("chat is read-only"));
        }
        let ids: Vec<String> = media.iter().map(|m| m.id.clone()).collect();
        self.events.lock().unwrap().push(format!("send:{}", ids.join(",")));
        self.sent.lock().unwrap().push(Sent::Group {
            ids,
            caption: first_caption.map(str::to_string),
        });
        Ok(())
    }
}

#[derive(Default)]
struct CountingProgress {
    started: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
}

impl ProgressSink for CountingProgress {
    fn on_start(&self, _item: &UploadItem) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_finish(&self, _item: &UploadItem, error: Option<&AppError>) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if error.is_some() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn name(index: usize) -> String {
    format!("{:02}.jpg", index)
}

fn peer() -> Arc<Peer> {
    Arc::new(Peer::new("@album_test"))
}

fn items(count: usize, caption: &str) -> Vec<UploadItem> {
    let peer = peer();
    (0..count)
        .map(|i| UploadItem {
            file: Blob::new(format!("/photos/{}", name(i)), name(i), 1024),
            thumb: None,
            peer: peer.clone(),
            as_photo: true,
            mime: "image/jpeg".to_string(),
            info: None,
            caption: caption.to_string(),
            remove: false,
        })
        .collect()
}

fn uploader(
    backend: &Arc<MockBackend>,
    progress: Arc<dyn ProgressSink>,
    limit: usize,
    as_album: bool,
    max_album_size: usize,
) -> Uploader {
    Uploader::new(UploaderOptions {
        transfer: backend.clone(),
        registrar: backend.clone(),
        sender: backend.clone(),
        progress,
        threads: 2,
        limit,
        as_album,
        max_album_size,
    })
    .unwrap()
}

fn expected_ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(name).collect()
}

#[tokio::test]
async fn test_album_groups_in_order_with_caption_once() {
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 4, true, 10);
    let mut source = VecSource::new(items(25, "holiday"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 25);
    assert_eq!(summary.failed, 0);

    let sent = backend.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent[0],
        Sent::Group {
            ids: expected_ids(0..10),
            caption: Some("holiday".to_string())
        }
    );
    assert_eq!(
        sent[1],
        Sent::Group {
            ids: expected_ids(10..20),
            caption: None
        }
    );
    assert_eq!(
        sent[2],
        Sent::Group {
            ids: expected_ids(20..25),
            caption: None
        }
    );
}

#[tokio::test]
async fn test_group_cap_above_protocol_limit_splits_sends() {
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 4, true, 20);
    let mut source = VecSource::new(items(25, "big"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 25);
    assert_eq!(
        backend.sent(),
        vec![
            Sent::Group {
                ids: expected_ids(0..10),
                caption: Some("big".to_string())
            },
            Sent::Group {
                ids: expected_ids(10..20),
                caption: None
            },
            Sent::Group {
                ids: expected_ids(20..25),
                caption: None
            },
        ]
    );
}

#[tokio::test]
async fn test_wide_concurrency_limit() {
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 64, false, 10);
    let mut source = VecSource::new(items(70, "wide"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 70);
    assert_eq!(backend.sent_ids(), expected_ids(0..70));
}

#[tokio::test]
async fn test_failed_item_is_skipped_and_rest_drained() {
    let backend = Arc::new(MockBackend {
        failing: [name(3)].into_iter().collect(),
        ..MockBackend::default()
    });
    let progress = Arc::new(CountingProgress::default());
    let uploader = uploader(&backend, progress.clone(), 3, true, 10);
    let mut source = VecSource::new(items(12, "trip"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 11);
    assert_eq!(summary.failed, 1);

    // The gap at #3 blocks early flushing; the final drain sends the other
    // eleven split at the group limit.
    let mut expected: Vec<String> = expected_ids(0..12);
    expected.remove(3);
    let sent = backend.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0],
        Sent::Group {
            ids: expected[..10].to_vec(),
            caption: Some("trip".to_string())
        }
    );
    assert_eq!(
        sent[1],
        Sent::Group {
            ids: expected[10..].to_vec(),
            caption: None
        }
    );

    assert_eq!(progress.started.load(Ordering::SeqCst), 12);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 12);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_upload_still_reports_finish() {
    let backend = Arc::new(MockBackend {
        panicking: [name(2)].into_iter().collect(),
        ..MockBackend::default()
    });
    let progress = Arc::new(CountingProgress::default());
    let uploader = uploader(&backend, progress.clone(), 2, true, 10);
    let mut source = VecSource::new(items(5, "shaky"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(progress.started.load(Ordering::SeqCst), 5);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 5);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);

    let mut expected = expected_ids(0..5);
    expected.remove(2);
    assert_eq!(backend.sent_ids(), expected);
}

#[tokio::test]
async fn test_send_order_matches_source_order_under_jitter() {
    let delays = (0..30)
        .map(|i| (name(i), Duration::from_millis(((i * 37) % 11) as u64 * 3)))
        .collect();
    let backend = Arc::new(MockBackend {
        delays,
        ..MockBackend::default()
    });
    let uploader = uploader(&backend, Arc::new(NoProgress), 8, true, 5);
    let mut source = VecSource::new(items(30, "jitter"));

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 30);
    assert_eq!(backend.sent_ids(), expected_ids(0..30));
    for group in backend.sent() {
        assert!(group.ids().len() <= 5);
    }
}

#[tokio::test]
async fn test_ready_group_sent_before_stragglers_finish() {
    let backend = Arc::new(MockBackend {
        delays: [(name(3), Duration::from_millis(300))].into_iter().collect(),
        ..MockBackend::default()
    });
    let uploader = uploader(&backend, Arc::new(NoProgress), 4, true, 2);
    let mut source = VecSource::new(items(4, "early"));

    uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    let events = backend.events();
    let first_send = events
        .iter()
        .position(|e| e == &format!("send:{},{}", name(0), name(1)))
        .expect("first pair sent");
    let straggler = events
        .iter()
        .position(|e| e == &format!("done:{}", name(3)))
        .expect("straggler finished");
    assert!(first_send < straggler, "events: {:?}", events);
    assert_eq!(backend.sent_ids(), expected_ids(0..4));
}

#[tokio::test]
async fn test_cancel_drains_completed_then_reports() {
    let delays = (0..20)
        .map(|i| (name(i), Duration::from_millis(20)))
        .collect();
    let backend = Arc::new(MockBackend {
        delays,
        ..MockBackend::default()
    });
    let uploader = uploader(&backend, Arc::new(NoProgress), 2, true, 10);
    let mut source = VecSource::new(items(20, "partial"));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let err = uploader
        .run(&cancel, &mut source, peer())
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    let sent_ids = backend.sent_ids();
    match err {
        AppError::UploadCancelled { sent, session_id, .. } => {
            assert_eq!(sent, sent_ids.len());
            assert!(!session_id.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!sent_ids.is_empty());
    assert!(sent_ids.len() < 20);
    let mut sorted = sent_ids.clone();
    sorted.sort();
    assert_eq!(sent_ids, sorted);
}

#[tokio::test]
async fn test_send_failure_is_fatal() {
    let backend = Arc::new(MockBackend {
        fail_sends: true,
        ..MockBackend::default()
    });
    let uploader = uploader(&backend, Arc::new(NoProgress), 4, true, 10);
    let mut source = VecSource::new(items(25, "doomed"));

    let err = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::SendFailed { index: 0, .. }), "{err}");
    assert!(!err.is_cancelled());
    assert_eq!(backend.send_attempts.load(Ordering::SeqCst), 1);
    assert!(backend.sent().is_empty());
}

#[tokio::test]
async fn test_individual_mode_keeps_each_caption() {
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 3, false, 10);

    let mut list = items(5, "");
    for (i, item) in list.iter_mut().enumerate() {
        item.caption = format!("caption {}", i);
    }
    let mut source = VecSource::new(list);

    let summary = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    assert_eq!(summary.sent, 5);
    let expected: Vec<Sent> = (0..5)
        .map(|i| Sent::Single {
            id: name(i),
            caption: format!("caption {}", i),
        })
        .collect();
    assert_eq!(backend.sent(), expected);
}

/// Yields a fixed number of items and then fails
struct BrokenSource {
    inner: VecSource,
    remaining: usize,
    failed: bool,
}

#[async_trait]
impl ItemSource for BrokenSource {
    async fn advance(&mut self, cancel: &CancellationToken) -> bool {
        if self.remaining == 0 {
            self.failed = true;
            return false;
        }
        self.remaining -= 1;
        self.inner.advance(cancel).await
    }

    fn current(&mut self) -> Option<UploadItem> {
        self.inner.current()
    }

    fn err(&mut self) -> Option<AppError> {
        if std::mem::take(&mut self.failed) {
            Some(AppError::file_not_found("/photos/missing.jpg"))
        } else {
            self.inner.err()
        }
    }
}

#[tokio::test]
async fn test_source_error_still_sends_uploaded_items() {
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 2, true, 10);
    let mut source = BrokenSource {
        inner: VecSource::new(items(10, "broken")),
        remaining: 3,
        failed: false,
    };

    let err = uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Source(_)), "{err}");
    assert_eq!(backend.sent_ids(), expected_ids(0..3));
}

#[tokio::test]
async fn test_remove_deletes_sent_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let uploader = uploader(&backend, Arc::new(NoProgress), 2, true, 10);

    let mut list = items(3, "cleanup");
    for item in list.iter_mut() {
        let path = dir.path().join(&item.file.name);
        std::fs::write(&path, b"jpeg").unwrap();
        item.file.path = path;
        item.remove = true;
    }
    let paths: Vec<_> = list.iter().map(|i| i.file.path.clone()).collect();
    let mut source = VecSource::new(list);

    uploader
        .run(&CancellationToken::new(), &mut source, peer())
        .await
        .unwrap();

    for path in paths {
        assert!(!path.exists(), "{} should be removed", path.display());
    }
}

#[test]
fn test_invalid_settings_rejected() {
    let backend = Arc::new(MockBackend::default());
    let result = Uploader::new(UploaderOptions {
        transfer: backend.clone(),
        registrar: backend.clone(),
        sender: backend,
        progress: Arc::new(NoProgress),
        threads: 2,
        limit: 0,
        as_album: true,
        max_album_size: 10,
    });
    assert!(result.is_err());
}
