use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::backend::ProgressSink;
use super::item::UploadItem;
use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUpload {
    pub file_path: String,
    pub error: String,
    pub is_retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub total_items: usize,
    pub started: usize,
    pub completed: usize,
    pub current_item: Option<String>,
    pub in_flight: Vec<String>,
    pub failed_uploads: Vec<FailedUpload>,
    pub successful_uploads: Vec<String>,
    pub cancelled: usize,
    pub session_status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

impl UploadProgress {
    fn new(total_items: usize) -> Self {
        Self {
            total_items,
            started: 0,
            completed: 0,
            current_item: None,
            in_flight: Vec::new(),
            failed_uploads: Vec::new(),
            successful_uploads: Vec::new(),
            cancelled: 0,
            session_status: SessionStatus::Active,
            started_at: Utc::now(),
        }
    }
}

/// Keeps a running picture of one upload session and logs each transition
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<UploadProgress>>,
}

impl ProgressTracker {
    pub fn new(total_items: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(UploadProgress::new(total_items))),
        }
    }

    /// Apply `f` to the progress state; a poisoned lock only loses progress
    fn update<F>(&self, operation: &str, f: F)
    where
        F: FnOnce(&mut UploadProgress),
    {
        match self.state.lock() {
            Ok(mut progress) => f(&mut progress),
            Err(e) => {
                log::error!(
                    "Failed to acquire progress lock for {} (non-critical): {}",
                    operation,
                    e
                );
            }
        }
    }

    pub fn snapshot(&self) -> Option<UploadProgress> {
        self.state.lock().ok().map(|progress| progress.clone())
    }

    pub fn mark_session_completed(&self) {
        self.update("mark completed", |progress| {
            progress.session_status = SessionStatus::Completed;
            progress.current_item = None;
            log::info!(
                "Session completed: {}/{} successful, {} failed",
                progress.successful_uploads.len(),
                progress.total_items,
                progress.failed_uploads.len()
            );
        });
    }

    pub fn mark_session_cancelled(&self) {
        self.update("mark cancelled", |progress| {
            progress.session_status = SessionStatus::Cancelled;
            progress.current_item = None;
            log::info!(
                "Session cancelled with {} completed uploads",
                progress.successful_uploads.len()
            );
        });
    }

    pub fn mark_session_failed(&self) {
        self.update("mark failed", |progress| {
            progress.session_status = SessionStatus::Failed;
            progress.current_item = None;
            log::error!(
                "Session marked as failed: {}/{} successful, {} failed",
                progress.successful_uploads.len(),
                progress.total_items,
                progress.failed_uploads.len()
            );
        });
    }
}

impl ProgressSink for ProgressTracker {
    fn on_start(&self, item: &UploadItem) {
        let path = item.file.path.display().to_string();
        self.update("start", |progress| {
            progress.started += 1;
            progress.current_item = Some(path.clone());
            progress.in_flight.push(path);
            log::debug!(
                "Progress: uploading {} ({}/{})",
                item.name(),
                progress.started,
                progress.total_items
            );
        });
    }

    fn on_finish(&self, item: &UploadItem, error: Option<&AppError>) {
        let path = item.file.path.display().to_string();
        self.update("finish", |progress| {
            progress.completed += 1;
            progress.in_flight.retain(|p| p != &path);
            progress.current_item = progress.in_flight.last().cloned();

            match error {
                None => {
                    log::info!(
                        "Progress: uploaded {} ({}/{})",
                        item.name(),
                        progress.completed,
                        progress.total_items
                    );
                    progress.successful_uploads.push(path);
                }
                Some(e) if e.is_cancelled() => {
                    progress.cancelled += 1;
                }
                Some(e) => {
                    log::warn!(
                        "Progress: failed to upload {} - {} ({}/{})",
                        item.name(),
                        e,
                        progress.completed,
                        progress.total_items
                    );
                    progress.failed_uploads.push(FailedUpload {
                        file_path: path,
                        error: e.to_string(),
                        is_retryable: e.is_retryable(),
                    });
                }
            }
        });
    }
}
