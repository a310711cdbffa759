use super::backend::MediaRef;
use super::item::UploadItem;

/// A successfully registered item waiting for its turn to be sent
#[derive(Debug, Clone)]
pub struct MediaBinding {
    pub index: usize,
    pub item: UploadItem,
    pub media: MediaRef,
}

/// Bindings removed from the buffer together, in index order
#[derive(Debug)]
pub struct Flush {
    pub bindings: Vec<MediaBinding>,
    pub has_caption: bool,
}

impl Flush {
    pub fn first_index(&self) -> Option<usize> {
        self.bindings.first().map(|b| b.index)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.bindings.last().map(|b| b.index)
    }
}

/// Out-of-order completions, kept sorted by index, with the cursor of the
/// lowest index not yet flushed.
///
/// Every buffered binding has `index >= next_flush_index`, and the cursor only
/// moves forward by the size of an early flush.
#[derive(Debug)]
pub struct OrderingBuffer {
    pending: Vec<MediaBinding>,
    next_flush_index: usize,
    has_caption: bool,
    group_cap: usize,
}

impl OrderingBuffer {
    pub fn new(group_cap: usize) -> Self {
        Self {
            pending: Vec::new(),
            next_flush_index: 0,
            has_caption: true,
            group_cap: group_cap.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_flush_index(&self) -> usize {
        self.next_flush_index
    }

    pub fn has_caption(&self) -> bool {
        self.has_caption
    }

    pub fn insert(&mut self, binding: MediaBinding) {
        debug_assert!(binding.index >= self.next_flush_index);
        let pos = self.pending.partition_point(|b| b.index < binding.index);
        self.pending.insert(pos, binding);
    }

    /// Remove the first `group_cap` bindings if they are exactly the run
    /// `next_flush_index .. next_flush_index + group_cap`.
    ///
    /// Only the first `group_cap` entries are looked at; a longer contiguous
    /// prefix still leaves in `group_cap`-sized groups, one per insertion.
    pub fn take_ready(&mut self) -> Option<Flush> {
        let k = self.group_cap;
        if self.pending.len() < k {
            return None;
        }

        let first = self.pending[0].index;
        let last = self.pending[k - 1].index;
        if first != self.next_flush_index || last != self.next_flush_index + k - 1 {
            return None;
        }

        let bindings: Vec<MediaBinding> = self.pending.drain(..k).collect();
        self.next_flush_index += k;
        Some(self.consume_caption(bindings))
    }

    /// Remove everything left, ignoring contiguity. Used once the stream has
    /// ended and every worker is done.
    pub fn drain(&mut self) -> Option<Flush> {
        if self.pending.is_empty() {
            return None;
        }

        let bindings = std::mem::take(&mut self.pending);
        Some(self.consume_caption(bindings))
    }

    fn consume_caption(&mut self, bindings: Vec<MediaBinding>) -> Flush {
        let has_caption = self.has_caption;
        self.has_caption = false;
        Flush {
            bindings,
            has_caption,
        }
    }
}
