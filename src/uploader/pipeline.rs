use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::backend::{
    DocumentAttribute, InputMedia, MediaRef, MediaRegistrar, RemoteFile, TransferBackend,
};
use super::item::UploadItem;
use crate::errors::{AppError, AppResult, UploadStep};
use crate::media::{MediaInfo, MediaKind};

/// Fixed part size of the remote store's chunked transfer
pub const MAX_PART_SIZE: usize = 512 * 1024;

/// Transfer-then-register for a single item
pub struct UploadPipeline {
    transfer: Arc<dyn TransferBackend>,
    registrar: Arc<dyn MediaRegistrar>,
    threads: usize,
}

impl UploadPipeline {
    pub fn new(
        transfer: Arc<dyn TransferBackend>,
        registrar: Arc<dyn MediaRegistrar>,
        threads: usize,
    ) -> Self {
        Self {
            transfer,
            registrar,
            threads: threads.max(1),
        }
    }

    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        item: &UploadItem,
    ) -> AppResult<MediaRef> {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled("upload start"));
        }

        let file = self
            .transfer
            .transfer(cancel, &item.file, self.threads, MAX_PART_SIZE)
            .await
            .map_err(|e| AppError::at_step(UploadStep::Transfer, e))?;

        log::debug!(
            "Transferred {} ({} bytes, {} parts)",
            item.name(),
            file.size,
            file.parts
        );

        let kind = MediaKind::select(&item.mime, item.as_photo);
        let thumb = if kind == MediaKind::Video {
            self.upload_thumb(cancel, item).await?
        } else {
            None
        };

        let media = build_media(kind, item, file, thumb);

        // Grouped sends only accept media the backend already knows, so every
        // item is registered up front without sending anything.
        self.registrar
            .register(cancel, &item.peer, media)
            .await
            .map_err(|e| AppError::at_step(UploadStep::Register, e))
    }

    /// A missing thumbnail is not worth failing the item over, but a
    /// cancellation still is.
    async fn upload_thumb(
        &self,
        cancel: &CancellationToken,
        item: &UploadItem,
    ) -> AppResult<Option<RemoteFile>> {
        let Some(thumb) = &item.thumb else {
            return Ok(None);
        };

        match self
            .transfer
            .transfer(cancel, thumb, 1, MAX_PART_SIZE)
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.is_cancelled() => Err(AppError::at_step(UploadStep::Thumbnail, e)),
            Err(e) => {
                log::warn!(
                    "Thumbnail upload failed for {}, sending without it: {}",
                    item.name(),
                    e
                );
                Ok(None)
            }
        }
    }
}

/// Filename always, plus the kind-specific attribute
pub fn build_attributes(kind: MediaKind, item: &UploadItem) -> Vec<DocumentAttribute> {
    let mut attributes = vec![DocumentAttribute::Filename {
        file_name: item.file.name.clone(),
    }];

    match kind {
        MediaKind::Video => attributes.push(video_attribute(item.info.as_ref())),
        MediaKind::Audio => attributes.push(DocumentAttribute::Audio),
        MediaKind::Photo | MediaKind::Document => {}
    }

    attributes
}

/// Unknown values are left out rather than sent as zeros
fn video_attribute(info: Option<&MediaInfo>) -> DocumentAttribute {
    let positive_u32 = |v: u32| (v > 0).then_some(v);

    DocumentAttribute::Video {
        supports_streaming: true,
        duration: info.map(|i| i.duration).filter(|d| *d > 0.0),
        width: info.and_then(|i| positive_u32(i.width)),
        height: info.and_then(|i| positive_u32(i.height)),
    }
}

pub fn build_media(
    kind: MediaKind,
    item: &UploadItem,
    file: RemoteFile,
    thumb: Option<RemoteFile>,
) -> InputMedia {
    if kind == MediaKind::Photo {
        return InputMedia::Photo { file };
    }

    InputMedia::Document {
        kind,
        file,
        mime_type: item.mime.clone(),
        attributes: build_attributes(kind, item),
        thumb: if kind == MediaKind::Video { thumb } else { None },
        nosound_video: kind == MediaKind::Video,
    }
}
