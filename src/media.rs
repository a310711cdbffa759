use serde::{Deserialize, Serialize};
use std::path::Path;

/// Probed properties of a video file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

/// How an item is presented by the messaging backend, resolved once per item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Photo only for non-webp images when photos were requested; webp is
    /// rejected as a photo by the backend and goes out as a document.
    pub fn select(mime: &str, as_photo: bool) -> Self {
        if is_image(mime) && mime != "image/webp" && as_photo {
            MediaKind::Photo
        } else if is_video(mime) {
            MediaKind::Video
        } else if is_audio(mime) {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }
}

pub fn is_image(mime: &str) -> bool {
    mime.starts_with("image/")
}

pub fn is_video(mime: &str) -> bool {
    mime.starts_with("video/")
}

pub fn is_audio(mime: &str) -> bool {
    mime.starts_with("audio/")
}

/// Detect MIME type based on file extension
pub fn detect_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("heic") => "image/heic",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("ts") => "video/mp2t",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Source of video properties. Passed in by whoever builds the item source so
/// the probing tool's lifecycle stays with the caller.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path, mime: &str) -> Option<MediaInfo>;
}

/// Probe that never knows anything; items go out without video attributes
pub struct NoProbe;

impl MediaProbe for NoProbe {
    fn probe(&self, _path: &Path, _mime: &str) -> Option<MediaInfo> {
        None
    }
}
