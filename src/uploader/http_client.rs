use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backend::{
    InputMedia, MediaRef, MediaRegistrar, MessageSender, Peer, RemoteFile, TransferBackend,
};
use super::item::Blob;
use super::retry::{extract_retry_after, should_retry_status, with_retry, RetryConfig};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;

/// Connection settings for [`HttpBackend`]
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub rate_limit_delay: Duration,
    pub retry: RetryConfig,
}

impl From<&Config> for HttpBackendConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
            retry: RetryConfig::with_max_retries(config.max_retry_attempts),
        }
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    peer: &'a str,
    media: &'a InputMedia,
}

#[derive(Deserialize)]
struct RegisterResponse {
    media_id: String,
}

#[derive(Serialize)]
struct SingleMedia<'a> {
    media_id: &'a str,
    random_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    peer: &'a str,
    #[serde(flatten)]
    media: SingleMedia<'a>,
}

#[derive(Serialize)]
struct SendGroupRequest<'a> {
    peer: &'a str,
    media: Vec<SingleMedia<'a>>,
}

/// Bot-style HTTP API client: chunked part uploads, media registration and
/// message sends, with retry and per-peer rate limiting.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    config: Arc<HttpBackendConfig>,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> AppResult<Self> {
        InputValidator::validate_endpoint_url(&config.endpoint)?;

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map a response to its body, turning retryable statuses into errors the
    /// retry loop understands.
    async fn check(response: Response, what: &str) -> AppResult<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status.is_success() {
            log::debug!(
                "{} response (first 300 chars): {}",
                what,
                body.chars().take(300).collect::<String>()
            );
            return Ok(body);
        }

        if status.as_u16() == 429 {
            if let Some(delay) = extract_retry_after(&body) {
                return Err(AppError::RateLimit {
                    retry_after_ms: delay.as_millis() as u64,
                });
            }
        }

        let reason = format!("{} returned {}: {}", what, status, body);
        if should_retry_status(status.as_u16()) {
            Err(AppError::upload_failed(reason))
        } else {
            Err(AppError::validation(what, &reason))
        }
    }

    /// Race a request against the cancellation token
    async fn cancelable<T>(
        cancel: &CancellationToken,
        phase: &str,
        fut: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        tokio::select! {
            result = fut => result,
            _ = cancel.cancelled() => Err(AppError::cancelled(phase)),
        }
    }

    async fn upload_part(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        blob: &Blob,
        part: u32,
        total_parts: u32,
        part_size: usize,
    ) -> AppResult<()> {
        let data = blob.read_part(part, part_size).await?;
        let url = self.url(&format!("files/{}/parts/{}", file_id, part));
        let what = format!("part {}/{} of {}", part + 1, total_parts, blob.name);
        let what = what.as_str();

        with_retry(&self.config.retry, Some(cancel), what, || {
            let form = multipart::Form::new()
                .text("total_parts", total_parts.to_string())
                .text("file_name", blob.name.clone())
                .part(
                    "data",
                    multipart::Part::bytes(data.clone()).file_name(blob.name.clone()),
                );
            let request = self.authorize(self.client.post(&url)).multipart(form);

            Self::cancelable(cancel, "transfer", async move {
                Self::check(request.send().await?, what).await.map(|_| ())
            })
        })
        .await
    }

    async fn post_json<B: Serialize>(
        &self,
        cancel: Option<&CancellationToken>,
        path: &str,
        body: &B,
        what: &str,
    ) -> AppResult<String> {
        let url = self.url(path);

        with_retry(&self.config.retry, cancel, what, || {
            let request = self.authorize(self.client.post(&url)).json(body);
            async move {
                let send = async { Self::check(request.send().await?, what).await };
                match cancel {
                    Some(cancel) => Self::cancelable(cancel, what, send).await,
                    None => send.await,
                }
            }
        })
        .await
    }

    async fn wait_for_rate_limit(&self, peer_id: &str) {
        let wait_time = {
            match self.rate_limiter.lock() {
                Ok(rate_limiter) => rate_limiter.get(peer_id).and_then(|last_request| {
                    let elapsed = last_request.elapsed();
                    (elapsed < self.config.rate_limit_delay)
                        .then(|| self.config.rate_limit_delay - elapsed)
                }),
                Err(e) => {
                    log::warn!("Failed to acquire rate limiter lock (non-critical): {}", e);
                    None
                }
            }
        }; // MutexGuard is dropped here

        if let Some(wait_time) = wait_time {
            sleep(wait_time).await;
        }
    }

    fn update_rate_limit(&self, peer_id: &str) {
        match self.rate_limiter.lock() {
            Ok(mut rate_limiter) => {
                rate_limiter.insert(peer_id.to_string(), Instant::now());
            }
            Err(e) => {
                log::warn!("Failed to update rate limiter (non-critical): {}", e);
            }
        }
    }
}

#[async_trait]
impl TransferBackend for HttpBackend {
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        blob: &Blob,
        threads: usize,
        part_size: usize,
    ) -> AppResult<RemoteFile> {
        let file_id = Uuid::new_v4().simple().to_string();
        let total_parts = blob.part_count(part_size);
        let name = InputValidator::sanitize_filename(&blob.name);

        log::debug!(
            "Uploading {} as {} ({} parts, {} threads)",
            blob.name,
            file_id,
            total_parts,
            threads
        );

        let semaphore = Arc::new(Semaphore::new(threads.max(1)));
        let mut parts = JoinSet::new();

        for part in 0..total_parts {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| AppError::Internal(format!("part semaphore closed: {}", e)))?,
                _ = cancel.cancelled() => return Err(AppError::cancelled("transfer")),
            };

            // Reap finished parts so a failure stops the remaining ones early
            while let Some(done) = parts.try_join_next() {
                done.map_err(|e| AppError::Internal(format!("part task failed: {}", e)))??;
            }

            let backend = self.clone();
            let cancel = cancel.clone();
            let blob = blob.clone();
            let file_id = file_id.clone();
            parts.spawn(async move {
                let _permit = permit;
                backend
                    .upload_part(&cancel, &file_id, &blob, part, total_parts, part_size)
                    .await
            });
        }

        while let Some(done) = parts.join_next().await {
            done.map_err(|e| AppError::Internal(format!("part task failed: {}", e)))??;
        }

        Ok(RemoteFile {
            id: file_id,
            parts: total_parts,
            name,
            size: blob.size,
        })
    }
}

#[async_trait]
impl MediaRegistrar for HttpBackend {
    async fn register(
        &self,
        cancel: &CancellationToken,
        peer: &Peer,
        media: InputMedia,
    ) -> AppResult<MediaRef> {
        let kind = media.kind();
        let body = RegisterRequest {
            peer: &peer.id,
            media: &media,
        };

        let response = self
            .post_json(Some(cancel), "media", &body, "register media")
            .await?;
        let registered: RegisterResponse = serde_json::from_str(&response)?;

        Ok(MediaRef {
            id: registered.media_id,
            kind,
        })
    }
}

// Sends take no cancellation token: the final flush after a cancel must still
// go out.
#[async_trait]
impl MessageSender for HttpBackend {
    async fn send_single(&self, peer: &Peer, media: &MediaRef, caption: &str) -> AppResult<()> {
        self.wait_for_rate_limit(&peer.id).await;

        let body = SendRequest {
            peer: &peer.id,
            media: SingleMedia {
                media_id: &media.id,
                random_id: Uuid::new_v4().to_string(),
                caption: (!caption.is_empty()).then_some(caption),
            },
        };
        let result = self.post_json(None, "messages", &body, "send media").await;

        self.update_rate_limit(&peer.id);
        result.map(|_| ())
    }

    async fn send_group(
        &self,
        peer: &Peer,
        media: &[MediaRef],
        first_caption: Option<&str>,
    ) -> AppResult<()> {
        self.wait_for_rate_limit(&peer.id).await;

        let body = SendGroupRequest {
            peer: &peer.id,
            media: media
                .iter()
                .enumerate()
                .map(|(i, m)| SingleMedia {
                    media_id: &m.id,
                    random_id: Uuid::new_v4().to_string(),
                    caption: if i == 0 {
                        first_caption.filter(|c| !c.is_empty())
                    } else {
                        None
                    },
                })
                .collect(),
        };
        let result = self
            .post_json(None, "messages/group", &body, "send media group")
            .await;

        self.update_rate_limit(&peer.id);
        result.map(|_| ())
    }
}
