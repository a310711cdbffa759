// Main uploader module - orchestrates all upload functionality
//
// Files are uploaded concurrently, registered as media, and sent to the
// destination in their original order, optionally grouped into albums.

pub mod backend;
pub mod http_client;
pub mod item;
pub mod ordering;
pub mod pipeline;
pub mod progress_tracker;
pub mod retry;
pub mod scheduler;
pub mod sender;

pub use backend::{
    DocumentAttribute, InputMedia, MediaRef, MediaRegistrar, MessageSender, NoProgress, Peer,
    ProgressSink, RemoteFile, TransferBackend,
};
pub use http_client::{HttpBackend, HttpBackendConfig};
pub use item::{Blob, ItemSource, UploadItem, VecSource};
pub use ordering::{Flush, MediaBinding, OrderingBuffer};
pub use pipeline::{UploadPipeline, MAX_PART_SIZE};
pub use progress_tracker::ProgressTracker;
pub use scheduler::{RunSummary, Uploader, UploaderOptions};
pub use sender::{BatchSender, PartialSend, MAX_GROUP_SIZE};
