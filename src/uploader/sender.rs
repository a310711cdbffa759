use std::sync::Arc;

use super::backend::{MediaRef, MessageSender, Peer};
use super::ordering::MediaBinding;
use crate::errors::AppError;

/// Hard limit on attachments in one grouped message
pub const MAX_GROUP_SIZE: usize = 10;

/// Sends flushed groups as albums or as individual messages
pub struct BatchSender {
    sender: Arc<dyn MessageSender>,
    as_album: bool,
    max_album_size: usize,
}

impl BatchSender {
    pub fn new(sender: Arc<dyn MessageSender>, as_album: bool, max_album_size: usize) -> Self {
        Self {
            sender,
            as_album,
            max_album_size: max_album_size.max(1),
        }
    }

    /// Sub-batch size used for grouped sends
    pub fn batch_size(&self) -> usize {
        self.max_album_size.min(MAX_GROUP_SIZE)
    }

    /// `group` must be non-empty and sorted by index
    pub async fn send(
        &self,
        group: &[MediaBinding],
        peer: &Peer,
        has_caption: bool,
    ) -> Result<(), PartialSend> {
        if group.is_empty() {
            return Ok(());
        }
        debug_assert!(group.windows(2).all(|w| w[0].index < w[1].index));

        if self.as_album {
            self.send_album(group, peer, has_caption).await
        } else {
            self.send_individually(group, peer).await
        }
    }

    async fn send_individually(
        &self,
        group: &[MediaBinding],
        peer: &Peer,
    ) -> Result<(), PartialSend> {
        for (sent, binding) in group.iter().enumerate() {
            self.sender
                .send_single(peer, &binding.media, &binding.item.caption)
                .await
                .map_err(|e| PartialSend::new(sent, AppError::send_failed(binding.index, e)))?;

            log::info!("Sent {} (#{})", binding.item.name(), binding.index);
            binding
                .item
                .do_remove()
                .await
                .map_err(|e| PartialSend::new(sent + 1, e))?;
        }

        Ok(())
    }

    async fn send_album(
        &self,
        group: &[MediaBinding],
        peer: &Peer,
        has_caption: bool,
    ) -> Result<(), PartialSend> {
        let chunks: Vec<&[MediaBinding]> = group.chunks(self.batch_size()).collect();
        let mut sent = 0;

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let media: Vec<MediaRef> = chunk.iter().map(|b| b.media.clone()).collect();
            let caption = (has_caption && chunk_index == 0).then(|| chunk[0].item.caption.as_str());

            self.sender
                .send_group(peer, &media, caption)
                .await
                .map_err(|e| PartialSend::new(sent, AppError::send_failed(chunk[0].index, e)))?;
            sent += chunk.len();

            log::info!(
                "Sent album {} of {} (#{}..=#{}, {} items)",
                chunk_index + 1,
                chunks.len(),
                chunk[0].index,
                chunk[chunk.len() - 1].index,
                chunk.len()
            );
        }

        for binding in group {
            binding
                .item
                .do_remove()
                .await
                .map_err(|e| PartialSend::new(sent, e))?;
        }

        Ok(())
    }
}

/// A group send that stopped part way; `sent` items reached the chat first
#[derive(Debug)]
pub struct PartialSend {
    pub sent: usize,
    pub error: AppError,
}

impl PartialSend {
    fn new(sent: usize, error: AppError) -> Self {
        Self { sent, error }
    }
}
