use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::errors::{AppError, AppResult};

/// Concurrent file uploads above this are allowed but usually just trip rate limits
pub const HIGH_LIMIT: usize = 32;
/// Upper bound on part uploads per file
pub const MAX_THREADS: usize = 16;

fn peer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(@?[A-Za-z0-9_]{1,64}|-?\d{1,20})$").unwrap())
}

fn endpoint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^https?://[A-Za-z0-9.\-]+(:\d{1,5})?(/[\w\-./~%]*)?$").unwrap())
}

fn unsafe_filename_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap())
}

pub struct InputValidator;

impl InputValidator {
    /// Chat handle: a username (optionally `@`-prefixed) or a numeric id
    pub fn validate_peer(peer: &str) -> AppResult<()> {
        let trimmed = peer.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("chat", "Chat cannot be empty"));
        }

        if !peer_pattern().is_match(trimmed) {
            return Err(AppError::validation(
                "chat",
                "Chat must be a username or a numeric id",
            ));
        }

        Ok(())
    }

    pub fn validate_endpoint_url(url: &str) -> AppResult<()> {
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("endpoint", "Endpoint URL cannot be empty"));
        }

        if trimmed.len() > 500 {
            return Err(AppError::validation("endpoint", "Endpoint URL too long"));
        }

        if !endpoint_pattern().is_match(trimmed) {
            return Err(AppError::invalid_endpoint(trimmed));
        }

        Ok(())
    }

    pub fn validate_file_path(path: &str) -> AppResult<()> {
        if path.trim().is_empty() {
            return Err(AppError::validation("file_path", "File path cannot be empty"));
        }

        let path_obj = Path::new(path);

        // Check for path traversal attempts
        if path_obj
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(AppError::validation("file_path", "Invalid file path detected"));
        }

        if !path_obj.exists() {
            return Err(AppError::file_not_found(path));
        }

        Ok(())
    }

    pub fn sanitize_filename(filename: &str) -> String {
        let sanitized = unsafe_filename_chars().replace_all(filename.trim(), "_");

        // Limit length
        if sanitized.chars().count() > 255 {
            let truncated: String = sanitized.chars().take(252).collect();
            format!("{}...", truncated)
        } else {
            sanitized.to_string()
        }
    }

    pub fn validate_upload_settings(
        limit: usize,
        max_album_size: usize,
        threads: usize,
    ) -> AppResult<()> {
        if limit == 0 {
            return Err(AppError::validation("limit", "Must be at least 1"));
        }
        if limit > HIGH_LIMIT {
            log::warn!(
                "Uploading {} files at once; expect rate limiting from the backend",
                limit
            );
        }

        // Larger groups are fine; sends split them at the protocol limit
        if max_album_size == 0 {
            return Err(AppError::validation("max_album_size", "Must be at least 1"));
        }

        if threads == 0 || threads > MAX_THREADS {
            return Err(AppError::validation("threads", "Must be between 1 and 16"));
        }

        Ok(())
    }
}
