// Local files as an ordered item source: walking, filtering, captions and
// lazy item construction for the scheduler.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::CaptionTemplate;
use crate::errors::{AppError, AppResult};
use crate::media::{self, MediaInfo, MediaProbe};
use crate::uploader::{Blob, ItemSource, Peer, UploadItem};

/// Extension of thumbnail sidecars: `clip.mp4` pairs with `clip.thumb`
pub const THUMB_EXT: &str = "thumb";

/// A file found on disk, not yet opened
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub thumb: PathBuf,
    pub mime: String,
    pub size: u64,
    pub info: Option<MediaInfo>,
    pub caption: String,
}

/// Collect files under `paths` in walk order
pub fn walk(paths: &[PathBuf], excludes: &[String], probe: &dyn MediaProbe) -> Vec<FileEntry> {
    let mut excluded: HashSet<String> = excludes
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();
    excluded.insert(THUMB_EXT.to_string());

    let mut files = Vec::new();
    for root in paths {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let ext = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if excluded.contains(&ext) {
                continue;
            }

            match build_entry(entry.path(), probe) {
                Ok(file) => files.push(file),
                Err(e) => log::warn!("Skip file {} because of error: {}", entry.path().display(), e),
            }
        }
    }

    files
}

fn build_entry(path: &Path, probe: &dyn MediaProbe) -> AppResult<FileEntry> {
    let size = std::fs::metadata(path)?.len();

    let mut mime = media::detect_mime(path).to_string();
    // Every video goes out as mp4 so the destination offers inline playback
    if media::is_video(&mime) {
        mime = "video/mp4".to_string();
    }

    let info = if media::is_video(&mime) {
        probe.probe(path, &mime)
    } else {
        None
    };

    Ok(FileEntry {
        path: path.to_path_buf(),
        thumb: path.with_extension(THUMB_EXT),
        mime,
        size,
        info,
        caption: String::new(),
    })
}

/// Drop empty files and files over `max_size` bytes
pub fn filter_file_size(files: Vec<FileEntry>, max_size: u64) -> Vec<FileEntry> {
    files
        .into_iter()
        .filter(|f| {
            if f.size == 0 {
                log::warn!("Skip file {} because file size is 0", f.path.display());
                return false;
            }
            if f.size > max_size {
                let err = AppError::file_too_large(&f.path.to_string_lossy(), f.size, max_size);
                log::warn!("Skip file: {}", err);
                return false;
            }
            true
        })
        .collect()
}

/// Fill in every entry's caption from the template.
///
/// Albums share one caption (the scheduler only attaches it once); an empty
/// body becomes a summary of what is being sent. Individual sends default to
/// the file name.
pub fn build_captions(files: &mut [FileEntry], as_album: bool, template: &CaptionTemplate) {
    let mut header = template.header.clone();
    if !header.is_empty() && !header.ends_with('\n') {
        header.push('\n');
    }

    if as_album {
        let body = if template.body.is_empty() {
            summarize(files)
        } else {
            template.body.clone()
        };
        let caption = format!("{}{}{}", header, body, template.footer);
        for file in files.iter_mut() {
            file.caption = caption.clone();
        }
        return;
    }

    for file in files.iter_mut() {
        let body = if template.body.is_empty() {
            let name = file
                .path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            format!("{}\n{}", name, video_details(file))
        } else {
            template.body.clone()
        };
        file.caption = format!("{}{}{}", header, body, template.footer);
    }
}

/// Size and duration line for probed videos, empty otherwise
fn video_details(file: &FileEntry) -> String {
    let Some(info) = file.info.as_ref().filter(|_| media::is_video(&file.mime)) else {
        return String::new();
    };

    let mut details = String::new();
    if file.size > 0 {
        details += &format!("Size: {:.2} MB\n", file.size as f64 / 1024.0 / 1024.0);
    }
    if info.duration > 0.0 {
        details += &format!("Duration: {:.2} min\n", info.duration / 60.0);
    }
    details
}

fn summarize(files: &[FileEntry]) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let (mut images, mut videos, mut audios, mut others) = (0, 0, 0, 0);
    let (mut image_size, mut video_size, mut video_duration) = (0u64, 0u64, 0f64);

    for file in files {
        if media::is_video(&file.mime) {
            videos += 1;
            video_size += file.size;
            video_duration += file.info.as_ref().map(|i| i.duration).unwrap_or_default();
        } else if media::is_audio(&file.mime) {
            audios += 1;
        } else if media::is_image(&file.mime) {
            images += 1;
            image_size += file.size;
        } else {
            others += 1;
        }
    }

    let mut body = String::new();
    if images > 0 {
        body += &format!("Images: {} ({:.2} GB)\n", images, image_size as f64 / GB);
    }
    if videos > 0 {
        body += &format!("Videos: {} ({:.2} GB)\n", videos, video_size as f64 / GB);
        body += &format!("Duration: {:.2} min\n", video_duration / 60.0);
    }
    if audios > 0 {
        body += &format!("Audio: {}\n", audios);
    }
    if others > 0 {
        body += &format!("Other: {}\n", others);
    }
    body
}

/// Options shared by every item a [`FileSource`] yields
#[derive(Debug, Clone)]
pub struct FileSourceOptions {
    pub peer: Arc<Peer>,
    pub as_photo: bool,
    pub remove: bool,
    /// Pause between items, not before the first
    pub delay: Duration,
}

pub struct FileSource {
    files: std::vec::IntoIter<FileEntry>,
    opts: FileSourceOptions,
    yielded: usize,
    current: Option<UploadItem>,
    err: Option<AppError>,
}

impl FileSource {
    pub fn new(files: Vec<FileEntry>, opts: FileSourceOptions) -> Self {
        Self {
            files: files.into_iter(),
            opts,
            yielded: 0,
            current: None,
            err: None,
        }
    }

    fn build_item(&self, entry: FileEntry) -> AppResult<UploadItem> {
        let file = Blob::from_path(&entry.path)?;

        let thumb = if media::is_video(&entry.mime) && valid_thumb(&entry.thumb) {
            Blob::from_path(&entry.thumb).ok()
        } else {
            None
        };

        Ok(UploadItem {
            file,
            thumb,
            peer: self.opts.peer.clone(),
            as_photo: self.opts.as_photo,
            mime: entry.mime,
            info: entry.info,
            caption: entry.caption,
            remove: self.opts.remove,
        })
    }
}

#[async_trait]
impl ItemSource for FileSource {
    async fn advance(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            self.err = Some(AppError::cancelled("item source"));
            return false;
        }
        if self.err.is_some() {
            return false;
        }

        let Some(entry) = self.files.next() else {
            return false;
        };

        if self.yielded > 0 && !self.opts.delay.is_zero() {
            tokio::select! {
                _ = sleep(self.opts.delay) => {}
                _ = cancel.cancelled() => {
                    self.err = Some(AppError::cancelled("item source"));
                    return false;
                }
            }
        }

        match self.build_item(entry) {
            Ok(item) => {
                self.yielded += 1;
                self.current = Some(item);
                true
            }
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn current(&mut self) -> Option<UploadItem> {
        self.current.take()
    }

    fn err(&mut self) -> Option<AppError> {
        self.err.take()
    }
}

/// A thumbnail is usable when it exists and decodes as an image
fn valid_thumb(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match thumb_dimensions(path) {
        Ok((width, height)) => {
            log::debug!("Using thumbnail {} ({}x{})", path.display(), width, height);
            true
        }
        Err(e) => {
            log::warn!("Ignoring thumbnail {}: {}", path.display(), e);
            false
        }
    }
}

/// Sidecars carry no image extension, so the format comes from the content
fn thumb_dimensions(path: &Path) -> AppResult<(u32, u32)> {
    let reader = image::ImageReader::open(path)?.with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NoProbe;

    fn entry(name: &str, mime: &str, size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(format!("/data/{name}")),
            thumb: PathBuf::from(format!("/data/{name}.thumb")),
            mime: mime.to_string(),
            size,
            info: None,
            caption: String::new(),
        }
    }

    fn opts() -> FileSourceOptions {
        FileSourceOptions {
            peer: Arc::new(Peer::new("chat")),
            as_photo: true,
            remove: false,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_walk_skips_excluded_and_thumbs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"b").unwrap();
        std::fs::write(dir.path().join("b.thumb"), b"t").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.mkv"), b"c").unwrap();

        let files = walk(
            &[dir.path().to_path_buf()],
            &[".txt".to_string()],
            &NoProbe,
        );

        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.mp4", "c.mkv"]);
        assert_eq!(files[2].mime, "video/mp4");
        assert_eq!(files[1].thumb, dir.path().join("b.thumb"));
    }

    #[test]
    fn test_filter_file_size() {
        let files = vec![
            entry("empty.jpg", "image/jpeg", 0),
            entry("ok.jpg", "image/jpeg", 10),
            entry("huge.mp4", "video/mp4", 100),
        ];

        let kept = filter_file_size(files, 50);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].path, PathBuf::from("/data/ok.jpg"));
    }

    #[test]
    fn test_album_captions_share_summary() {
        let mut files = vec![
            entry("a.jpg", "image/jpeg", 1024),
            entry("b.mp4", "video/mp4", 2048),
        ];
        let template = CaptionTemplate {
            header: "Trip".to_string(),
            body: String::new(),
            footer: "#travel".to_string(),
        };

        build_captions(&mut files, true, &template);

        assert_eq!(files[0].caption, files[1].caption);
        assert!(files[0].caption.starts_with("Trip\nImages: 1"));
        assert!(files[0].caption.contains("Videos: 1"));
        assert!(files[0].caption.ends_with("#travel"));
    }

    #[test]
    fn test_single_captions_default_to_file_name() {
        let mut files = vec![entry("a.jpg", "image/jpeg", 1)];
        build_captions(&mut files, false, &CaptionTemplate::default());
        assert_eq!(files[0].caption, "a.jpg\n");
    }

    #[test]
    fn test_single_video_caption_lists_size_and_duration() {
        let mut probed = entry("clip.mp4", "video/mp4", 3 * 1024 * 1024);
        probed.info = Some(MediaInfo {
            duration: 90.0,
            width: 1920,
            height: 1080,
            codec: "h264".to_string(),
        });
        let mut files = vec![probed, entry("raw.mp4", "video/mp4", 1024)];
        let template = CaptionTemplate {
            footer: "#clips".to_string(),
            ..CaptionTemplate::default()
        };

        build_captions(&mut files, false, &template);

        assert_eq!(
            files[0].caption,
            "clip.mp4\nSize: 3.00 MB\nDuration: 1.50 min\n#clips"
        );
        assert_eq!(files[1].caption, "raw.mp4\n#clips");
    }

    #[tokio::test]
    async fn test_file_source_yields_items_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.jpg", "2.jpg"] {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }
        let files = walk(&[dir.path().to_path_buf()], &[], &NoProbe);

        let mut source = FileSource::new(files, opts());
        let cancel = CancellationToken::new();

        assert!(source.advance(&cancel).await);
        assert_eq!(source.current().unwrap().name(), "1.jpg");
        assert!(source.advance(&cancel).await);
        let second = source.current().unwrap();
        assert_eq!(second.name(), "2.jpg");
        assert_eq!(second.file.size, 4);
        assert!(second.thumb.is_none());
        assert!(!source.advance(&cancel).await);
        assert!(source.err().is_none());
    }

    #[tokio::test]
    async fn test_video_picks_up_decodable_thumb() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"video").unwrap();
        image::RgbImage::new(4, 4)
            .save_with_format(dir.path().join("clip.thumb"), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(dir.path().join("other.mp4"), b"video").unwrap();
        std::fs::write(dir.path().join("other.thumb"), b"not an image").unwrap();

        let files = walk(&[dir.path().to_path_buf()], &[], &NoProbe);
        let mut source = FileSource::new(files, opts());
        let cancel = CancellationToken::new();

        assert!(source.advance(&cancel).await);
        let clip = source.current().unwrap();
        assert_eq!(clip.thumb.unwrap().path, dir.path().join("clip.thumb"));

        assert!(source.advance(&cancel).await);
        assert!(source.current().unwrap().thumb.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_ends_source_with_error() {
        let mut source = FileSource::new(vec![entry("gone.jpg", "image/jpeg", 1)], opts());

        assert!(!source.advance(&CancellationToken::new()).await);
        let err = source.err().expect("stat failure is reported");
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_during_delay() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.jpg", "2.jpg"] {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }
        let files = walk(&[dir.path().to_path_buf()], &[], &NoProbe);
        let mut source = FileSource::new(
            files,
            FileSourceOptions {
                delay: Duration::from_secs(30),
                ..opts()
            },
        );

        let cancel = CancellationToken::new();
        assert!(source.advance(&cancel).await);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert!(!source.advance(&cancel).await);
        assert!(source.err().unwrap().is_cancelled());
    }
}
