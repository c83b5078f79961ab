//! Image fetching over HTTP
//!
//! Turns an image URL into a decoded image. Every failure is scoped to the
//! one URL and reported as a [`FetchError`].

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::core::config::FetchConfig;
use crate::core::errors::{FetchError, FetchResult};
use crate::core::types::SharedImage;
use crate::utils::image_ops::load_image_from_memory_async;

/// Source of decoded images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult<SharedImage>;
}

/// Fetches images with a shared reqwest client
pub struct HttpImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    /// Only absolute http(s) URLs with a host are fetched
    pub fn validate_url(url: &str) -> FetchResult<Url> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !["http", "https"].contains(&parsed.scheme()) {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(parsed)
    }

    async fn download(&self, url: &str) -> FetchResult<Vec<u8>> {
        let parsed = Self::validate_url(url)?;

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::FetchFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let mut response = self.client.get(parsed).send().await.map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(too_large());
            }
        }

        let mut body = Vec::with_capacity(
            response
                .content_length()
                .map_or(64 * 1024, |len| len as usize),
        );
        while let Some(chunk) = response.chunk().await.map_err(map_err)? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<SharedImage> {
        let bytes = self.download(url).await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);

        let image = load_image_from_memory_async(bytes)
            .await
            .map_err(|e| FetchError::DecodeFailed {
                url: url.to_string(),
                message: format!("{:#}", e),
            })?;

        if image.width() == 0 || image.height() == 0 {
            return Err(FetchError::DecodeFailed {
                url: url.to_string(),
                message: "image has zero size".to_string(),
            });
        }

        Ok(Arc::new(image))
    }
}
