pub mod config;
pub mod errors;
pub mod media;
pub mod security;
pub mod source;
pub mod uploader;

pub use errors::{AppError, AppResult};
