use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;

const APP_DIR: &str = "album-uploader";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionTemplate {
    pub header: String,
    pub body: String,
    pub footer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub threads: usize,
    pub limit: usize,
    pub max_album_size: usize,
    pub as_album: bool,
    pub as_photo: bool,
    pub remove: bool,
    pub item_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub request_timeout_secs: u64,
    pub max_file_size_mb: u64,
    pub excludes: Vec<String>,
    pub log_level: String,
    pub caption: CaptionTemplate,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8081".to_string(),
            api_token: None,
            threads: 4,
            limit: 2,
            max_album_size: 10,
            as_album: false,
            as_photo: false,
            remove: false,
            item_delay_ms: 0,
            rate_limit_delay_ms: 1000,
            max_retry_attempts: 3,
            request_timeout_secs: 120,
            max_file_size_mb: 2000,
            excludes: Vec::new(),
            log_level: "info".to_string(),
            caption: CaptionTemplate::default(),
        }
    }
}

impl Config {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

pub fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join(APP_DIR);

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

/// Load and validate the config at `path`, or the default location, creating
/// it with defaults when missing.
pub fn load_config(path: Option<&Path>) -> AppResult<Config> {
    let config = read_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load without validating, so a broken file can still be shown or repaired
pub fn read_config(path: Option<&Path>) -> AppResult<Config> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config_internal(&config_path, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(path: Option<&Path>, config: &Config) -> AppResult<()> {
    validate_config(config)?;
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };
    save_config_internal(&config_path, config)
}

fn save_config_internal(config_path: &Path, config: &Config) -> AppResult<()> {
    // Create backup of existing config
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    InputValidator::validate_endpoint_url(&config.endpoint)?;
    InputValidator::validate_upload_settings(config.limit, config.max_album_size, config.threads)?;

    if config.rate_limit_delay_ms < 100 {
        return Err(AppError::validation(
            "rate_limit_delay_ms",
            "Must be at least 100ms",
        ));
    }

    if config.max_retry_attempts > 10 {
        return Err(AppError::validation(
            "max_retry_attempts",
            "Must be 10 or fewer",
        ));
    }

    if config.request_timeout_secs == 0 {
        return Err(AppError::validation(
            "request_timeout_secs",
            "Must be greater than 0",
        ));
    }

    if config.max_file_size_mb == 0 {
        return Err(AppError::validation(
            "max_file_size_mb",
            "Must be greater than 0",
        ));
    }

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

/// Reset configuration to defaults, keeping a backup of the old file
pub fn reset_config(path: Option<&Path>) -> AppResult<Config> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    if config_path.exists() {
        let backup_path = config_path.with_extension("json.reset_backup");
        fs::copy(&config_path, &backup_path)?;
        log::info!("Existing config backed up to {}", backup_path.display());
    }

    let default_config = Config::default();
    save_config_internal(&config_path, &default_config)?;

    log::info!("Configuration reset to defaults");
    Ok(default_config)
}
