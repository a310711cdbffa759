use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use super::backend::Peer;
use crate::errors::{AppError, AppResult};
use crate::media::MediaInfo;

/// A sized, named file on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

impl Blob {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
        }
    }

    /// Build from a path on disk, reading the size from its metadata
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| AppError::file_not_found(&path.to_string_lossy()))?;
        if !metadata.is_file() {
            return Err(AppError::invalid_file_type(&path.to_string_lossy()));
        }
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        Ok(Self::new(path, name, metadata.len()))
    }

    pub fn part_count(&self, part_size: usize) -> u32 {
        if self.size == 0 {
            return 1;
        }
        self.size.div_ceil(part_size as u64) as u32
    }

    /// Read part `index` of `part_size` bytes; the last part may be shorter.
    /// Each call opens the file, so parts can be read from several tasks.
    pub async fn read_part(&self, index: u32, part_size: usize) -> AppResult<Vec<u8>> {
        let offset = index as u64 * part_size as u64;
        let len = part_size.min(self.size.saturating_sub(offset) as usize);

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// One file to upload
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub file: Blob,
    pub thumb: Option<Blob>,
    pub peer: Arc<Peer>,
    pub as_photo: bool,
    pub mime: String,
    /// Only present for video
    pub info: Option<MediaInfo>,
    pub caption: String,
    pub remove: bool,
}

impl UploadItem {
    pub fn name(&self) -> &str {
        &self.file.name
    }

    /// Delete the local source and its thumbnail when the item asked for it
    pub async fn do_remove(&self) -> AppResult<()> {
        if !self.remove {
            return Ok(());
        }

        tokio::fs::remove_file(&self.file.path).await?;
        log::debug!("Removed {}", self.file.path.display());

        if let Some(thumb) = &self.thumb {
            tokio::fs::remove_file(&thumb.path).await?;
            log::debug!("Removed thumbnail {}", thumb.path.display());
        }

        Ok(())
    }
}

/// Ordered, lazily produced sequence of items. Pulled by a single
/// coordinating loop, so implementations need not be thread-safe.
#[async_trait]
pub trait ItemSource: Send {
    /// Move to the next item. Returns false once exhausted, canceled or failed.
    async fn advance(&mut self, cancel: &CancellationToken) -> bool;

    /// The item reached by the last successful `advance`
    fn current(&mut self) -> Option<UploadItem>;

    /// Terminal error, checked once after `advance` returned false
    fn err(&mut self) -> Option<AppError>;
}

/// Item source over a prepared list
pub struct VecSource {
    items: VecDeque<UploadItem>,
    current: Option<UploadItem>,
    err: Option<AppError>,
}

impl VecSource {
    pub fn new(items: Vec<UploadItem>) -> Self {
        Self {
            items: items.into(),
            current: None,
            err: None,
        }
    }
}

#[async_trait]
impl ItemSource for VecSource {
    async fn advance(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            self.err = Some(AppError::cancelled("item source"));
            return false;
        }

        self.current = self.items.pop_front();
        self.current.is_some()
    }

    fn current(&mut self) -> Option<UploadItem> {
        self.current.take()
    }

    fn err(&mut self) -> Option<AppError> {
        self.err.take()
    }
}
