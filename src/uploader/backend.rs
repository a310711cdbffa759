// Narrow interfaces to everything outside the scheduler: byte transfer, media
// registration, message sending and progress reporting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::item::{Blob, UploadItem};
use crate::errors::{AppError, AppResult};
use crate::media::MediaKind;

/// Destination chat, resolved once per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
}

impl Peer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Handle to a file whose bytes are already in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub parts: u32,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentAttribute {
    Filename {
        file_name: String,
    },
    Video {
        supports_streaming: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    Audio,
}

/// Media description handed to the registrar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputMedia {
    Photo {
        file: RemoteFile,
    },
    Document {
        kind: MediaKind,
        file: RemoteFile,
        mime_type: String,
        attributes: Vec<DocumentAttribute>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumb: Option<RemoteFile>,
        nosound_video: bool,
    },
}

impl InputMedia {
    pub fn kind(&self) -> MediaKind {
        match self {
            InputMedia::Photo { .. } => MediaKind::Photo,
            InputMedia::Document { kind, .. } => *kind,
        }
    }
}

/// Registered, reusable media; only meaningful for the peer it was
/// registered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub kind: MediaKind,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Move the blob's bytes to the remote store in `part_size` chunks using
    /// up to `threads` concurrent part uploads.
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        blob: &Blob,
        threads: usize,
        part_size: usize,
    ) -> AppResult<RemoteFile>;
}

#[async_trait]
pub trait MediaRegistrar: Send + Sync {
    /// Register media with the destination without sending a message
    async fn register(
        &self,
        cancel: &CancellationToken,
        peer: &Peer,
        media: InputMedia,
    ) -> AppResult<MediaRef>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_single(&self, peer: &Peer, media: &MediaRef, caption: &str) -> AppResult<()>;

    /// `media` never exceeds the protocol's group limit
    async fn send_group(
        &self,
        peer: &Peer,
        media: &[MediaRef],
        first_caption: Option<&str>,
    ) -> AppResult<()>;
}

pub trait ProgressSink: Send + Sync {
    fn on_start(&self, item: &UploadItem);
    fn on_finish(&self, item: &UploadItem, error: Option<&AppError>);
}

/// Sink for callers that don't care about progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_start(&self, _item: &UploadItem) {}
    fn on_finish(&self, _item: &UploadItem, _error: Option<&AppError>) {}
}
