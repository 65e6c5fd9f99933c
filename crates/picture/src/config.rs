// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::format::ImageFormat;
use crate::origin::{AllowedOrigins, InvalidOrigin};

/// Cache epoch used when none is configured.
pub const DEFAULT_CACHE_ID: &str = "ZDgzNGRjYzQtODE3NC00ZDQ2LTkzYzMtN2I2ZDcyMGEzMjZi";

/// Origin relative source URLs resolve against when no `base_url` is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cache_id is required and cannot be empty")]
    EmptyCacheId,
    #[error("at least one output format must be configured")]
    NoFormats,
    #[error("max_width must be positive")]
    ZeroMaxWidth,
    #[error("max_pixels must be at least max_width")]
    MaxPixels,
    #[error("default_quality must be between 0 and 100, got {0}")]
    DefaultQuality(u8),
    #[error("invalid origin: {0}")]
    Origin(#[from] InvalidOrigin),
}

/// Settings of an [`ImageProxy`](crate::ImageProxy), usually read from the `[image]`
/// table of the server's TOML config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Path the proxy is served at. Leading and trailing slashes don't matter.
    #[serde(default = "ProxyConfig::default_endpoint")]
    pub endpoint: String,

    /// Origins (e.g. `https://cdn.example`) absolute source URLs may point to.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// The proxy's own origin. Relative source URLs are fetched from here.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Output formats in priority order.
    #[serde(default = "ProxyConfig::default_formats")]
    pub formats: Vec<ImageFormat>,

    /// Part of every ETag; change it to invalidate all client caches at once.
    #[serde(default = "ProxyConfig::default_cache_id")]
    pub cache_id: String,

    /// `max-age` of successful responses, in seconds.
    #[serde(default = "ProxyConfig::default_cache_max_age")]
    pub cache_max_age: u64,

    #[serde(default = "ProxyConfig::default_max_width")]
    pub max_width: u32,

    #[serde(default = "ProxyConfig::default_quality")]
    pub default_quality: u8,

    /// Memory budget for cached source images.
    #[serde(default = "ProxyConfig::default_cache_capacity_bytes")]
    pub cache_capacity_bytes: usize,

    /// Larger source images are refused.
    #[serde(default = "ProxyConfig::default_max_upstream_bytes")]
    pub max_upstream_bytes: usize,

    /// Largest image, in pixels, decoded or produced by a transform.
    #[serde(default = "ProxyConfig::default_max_pixels")]
    pub max_pixels: u64,

    /// Longest honored `delay`, in milliseconds. Longer requests are cut down to it.
    #[serde(default = "ProxyConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Answer failed `Accept` negotiation with 406 instead of a 200 error payload.
    #[serde(default)]
    pub strict_negotiation: bool,

    /// Production mode ignores the `delay` parameter.
    #[serde(default)]
    pub production: bool,
}

impl ProxyConfig {
    pub fn default_endpoint() -> String {
        "/api/image".into()
    }

    pub fn default_formats() -> Vec<ImageFormat> {
        ImageFormat::ALL.to_vec()
    }

    pub fn default_cache_id() -> String {
        DEFAULT_CACHE_ID.into()
    }

    pub fn default_cache_max_age() -> u64 {
        3600 * 3
    }

    pub fn default_max_width() -> u32 {
        2048
    }

    pub fn default_quality() -> u8 {
        80
    }

    pub fn default_cache_capacity_bytes() -> usize {
        64 * 1024 * 1024
    }

    pub fn default_max_upstream_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub fn default_max_pixels() -> u64 {
        4096 * 4096
    }

    pub fn default_max_delay_ms() -> u64 {
        10_000
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Checks the configuration, returning the parsed origin allow-list.
    pub fn validate(&self) -> Result<AllowedOrigins, ConfigError> {
        if self.cache_id.is_empty() {
            return Err(ConfigError::EmptyCacheId);
        }
        if self.formats.is_empty() {
            return Err(ConfigError::NoFormats);
        }
        if self.max_width == 0 {
            return Err(ConfigError::ZeroMaxWidth);
        }
        if self.max_pixels < u64::from(self.max_width) {
            return Err(ConfigError::MaxPixels);
        }
        if self.default_quality > 100 {
            return Err(ConfigError::DefaultQuality(self.default_quality));
        }
        Ok(AllowedOrigins::new(&self.allowed_origins, self.base_url())?)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            allowed_origins: vec![],
            base_url: None,
            formats: Self::default_formats(),
            cache_id: Self::default_cache_id(),
            cache_max_age: Self::default_cache_max_age(),
            max_width: Self::default_max_width(),
            default_quality: Self::default_quality(),
            cache_capacity_bytes: Self::default_cache_capacity_bytes(),
            max_upstream_bytes: Self::default_max_upstream_bytes(),
            max_pixels: Self::default_max_pixels(),
            max_delay_ms: Self::default_max_delay_ms(),
            strict_negotiation: false,
            production: false,
        }
    }
}
