use std::fmt;
use thiserror::Error;

/// Step of the per-item pipeline that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    Transfer,
    Thumbnail,
    Register,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStep::Transfer => "transfer",
            UploadStep::Thumbnail => "thumbnail transfer",
            UploadStep::Register => "media registration",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file type: {path}")]
    InvalidFileType { path: String },

    #[error("File too large: {path} ({size} bytes, limit {limit} bytes)")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("Upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Rate limit exceeded. Retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Upload cancelled during {phase} for session {session_id} ({sent} items sent)")]
    UploadCancelled {
        phase: String,
        session_id: String,
        sent: usize,
    },

    #[error("{step} failed: {source}")]
    Step {
        step: UploadStep,
        #[source]
        source: Box<AppError>,
    },

    #[error("Send failed for batch starting at index {index}: {source}")]
    SendFailed {
        index: usize,
        #[source]
        source: Box<AppError>,
    },

    #[error("Item source error: {0}")]
    Source(#[source] Box<AppError>),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_file_type(path: &str) -> Self {
        Self::InvalidFileType {
            path: path.to_string(),
        }
    }

    pub fn file_too_large(path: &str, size: u64, limit: u64) -> Self {
        Self::FileTooLarge {
            path: path.to_string(),
            size,
            limit,
        }
    }

    pub fn invalid_endpoint(url: &str) -> Self {
        Self::InvalidEndpoint {
            url: url.to_string(),
        }
    }

    pub fn upload_failed(reason: impl Into<String>) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
        }
    }

    /// Cancellation observed while a run is still in flight; the session and
    /// sent count are filled in by the scheduler when it reports the run.
    pub fn cancelled(phase: &str) -> Self {
        Self::UploadCancelled {
            phase: phase.to_string(),
            session_id: String::new(),
            sent: 0,
        }
    }

    pub fn upload_cancelled(phase: &str, session_id: &str, sent: usize) -> Self {
        Self::UploadCancelled {
            phase: phase.to_string(),
            session_id: session_id.to_string(),
            sent,
        }
    }

    pub fn at_step(step: UploadStep, source: AppError) -> Self {
        Self::Step {
            step,
            source: Box::new(source),
        }
    }

    pub fn send_failed(index: usize, source: AppError) -> Self {
        Self::SendFailed {
            index,
            source: Box::new(source),
        }
    }

    /// True for cancellation, including cancellation wrapped by a pipeline
    /// step or an item source.
    pub fn is_cancelled(&self) -> bool {
        match self {
            AppError::UploadCancelled { .. } => true,
            AppError::Step { source, .. }
            | AppError::SendFailed { source, .. }
            | AppError::Source(source) => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network(_)
            | AppError::RateLimit { .. }
            | AppError::UploadFailed { .. }
            | AppError::Io(_) => true,
            AppError::Step { source, .. } | AppError::SendFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    /// Errors that will not go away on a retry of the same item
    pub fn is_permanent(&self) -> bool {
        match self {
            AppError::InvalidEndpoint { .. }
            | AppError::FileNotFound { .. }
            | AppError::InvalidFileType { .. }
            | AppError::FileTooLarge { .. }
            | AppError::Validation { .. } => true,
            AppError::Step { source, .. } | AppError::Source(source) => source.is_permanent(),
            _ => false,
        }
    }
}
