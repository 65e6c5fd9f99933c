// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The image transform request handler

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, VARY,
};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use tracing::{error, warn};
use url::Url;

use crate::cache::{CachedImage, ImageCache};
use crate::config::{ConfigError, ProxyConfig};
use crate::etag::{etag, if_none_match_matches};
use crate::fetch::{FetchError, Fetcher, ReqwestFetcher};
use crate::format::ImageFormat;
use crate::negotiate::{accepts_images, negotiate};
use crate::origin::AllowedOrigins;
use crate::params::TransformParams;
use crate::response::{empty, json_error, ImageResponse};
use crate::transform::transform_blocking;

/// Body of the response to requests whose `Accept` header allows none of the
/// configured formats.
pub const NEGOTIATION_ERROR: &str =
    "Request do not include a valid image content-type in the 'Accept' header";

/// Diagnostic header telling whether the source image came from the cache.
pub const CACHE_STATUS: &str = "cache-status";

/// Whether `path` names `endpoint`, ignoring leading and trailing slashes.
pub fn matches_endpoint(path: &str, endpoint: &str) -> bool {
    path.trim_matches('/') == endpoint.trim_matches('/')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("upstream image not found")]
    NotFound,
    #[error("upstream answered {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Serves resized and re-encoded versions of allow-listed images.
pub struct ImageProxy {
    config: ProxyConfig,
    origins: AllowedOrigins,
    cache: ImageCache,
    fetcher: Arc<dyn Fetcher>,
}

impl ImageProxy {
    /// Creates a proxy fetching upstream images with [`ReqwestFetcher`].
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let fetcher = ReqwestFetcher::new(config.max_upstream_bytes)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher))?)
    }

    pub fn with_fetcher(
        config: ProxyConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ConfigError> {
        let origins = config.validate()?;
        let cache = ImageCache::new(config.cache_capacity_bytes);
        Ok(Self {
            config,
            origins,
            cache,
            fetcher,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Whether this proxy should handle a request for `path`.
    pub fn matches_path(&self, path: &str) -> bool {
        matches_endpoint(path, &self.config.endpoint)
    }

    /// Handles one transform request. Failures are reported as error responses.
    pub async fn respond<B>(&self, request: &Request<B>) -> ImageResponse {
        let accept = request
            .headers()
            .get(ACCEPT)
            .and_then(|accept| accept.to_str().ok());
        if !matches!(*request.method(), Method::GET | Method::HEAD) || !accepts_images(accept) {
            return empty(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Some(negotiated) = negotiate(accept, &self.config.formats) else {
            let status = if self.config.strict_negotiation {
                StatusCode::NOT_ACCEPTABLE
            } else {
                StatusCode::OK
            };
            return json_error(status, NEGOTIATION_ERROR);
        };

        let params = match TransformParams::from_query(
            request.uri().query(),
            self.config.max_width,
            self.config.default_quality,
        ) {
            Ok(params) => params,
            Err(err) => return json_error(err.status(), err),
        };
        let url = match self.origins.resolve(&params.url) {
            Ok(url) => url,
            Err(err) => return json_error(err.status(), err),
        };
        let format = params.format.unwrap_or(negotiated);

        if let Some(delay) = params.delay {
            warn!(
                "A delay of {delay:?} was requested while loading {url}; \
                 it only applies outside of production."
            );
            let delay = delay.min(Duration::from_millis(self.config.max_delay_ms));
            if !self.config.production {
                tokio::time::sleep(delay).await;
            }
        }

        let etag = etag(
            &self.config.cache_id,
            url.as_str(),
            params.width,
            format,
            params.quality,
        );
        let not_modified = request
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|header| header.to_str().ok())
            .is_some_and(|header| if_none_match_matches(header, &etag));
        if not_modified {
            return self.with_caching_headers(empty(StatusCode::NOT_MODIFIED), &etag, "REVALIDATED");
        }

        let (source, cache_status) = match self.load(&url).await {
            Ok(loaded) => loaded,
            Err(LoadError::NotFound) => {
                let mut response = empty(StatusCode::NOT_FOUND);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(format.mime_type()));
                return response;
            }
            Err(err) => {
                error!("Unable to fetch {url}: {err}");
                let message = "Unable to fetch remote image";
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, message);
            }
        };

        let transformed = transform_blocking(
            source.bytes,
            params.width,
            format,
            params.quality,
            self.config.max_pixels,
        );
        match transformed.await {
            Ok(encoded) => self.image_response(encoded, format, &etag, cache_status),
            Err(err) => {
                error!("Unable to transform {url} into {format}: {err}");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch image")
            }
        }
    }

    async fn load(&self, url: &Url) -> Result<(CachedImage, CacheStatus), LoadError> {
        if let Some(image) = self.cache.get(url.as_str()) {
            return Ok((image, CacheStatus::Hit));
        }

        let upstream = self.fetcher.fetch(url).await?;
        if upstream.status == StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound);
        }
        if !upstream.status.is_success() {
            return Err(LoadError::Status(upstream.status));
        }

        let image = CachedImage {
            bytes: upstream.bytes,
            etag: upstream.etag,
        };
        self.cache.insert(url.as_str().to_owned(), image.clone());
        Ok((image, CacheStatus::Miss))
    }

    fn image_response(
        &self,
        encoded: Bytes,
        format: ImageFormat,
        etag: &str,
        cache_status: CacheStatus,
    ) -> ImageResponse {
        let mut response = Response::new(Full::new(encoded));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(format.mime_type()));
        self.with_caching_headers(response, etag, cache_status.as_str())
    }

    fn with_caching_headers(
        &self,
        mut response: ImageResponse,
        etag: &str,
        cache_status: &'static str,
    ) -> ImageResponse {
        let headers = response.headers_mut();
        if let Ok(cache_control) =
            HeaderValue::try_from(format!("public, max-age={}", self.config.cache_max_age))
        {
            headers.insert(CACHE_CONTROL, cache_control);
        }
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(CACHE_STATUS, HeaderValue::from_static(cache_status));
        headers.insert(VARY, HeaderValue::from_static("Content-Encoding"));
        // Hex digits and quotes only.
        if let Ok(etag) = HeaderValue::try_from(etag) {
            headers.insert(ETAG, etag);
        }
        response
    }
}

impl std::fmt::Debug for ImageProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProxy")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
