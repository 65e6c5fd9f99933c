// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An image transform proxy.
//!
//! [`ImageProxy`] answers requests like `/api/image?url=...&width=...&quality=...`
//! by fetching the source image from an allow-listed origin, scaling it and encoding
//! it in the best format the client's `Accept` header allows. Entity tags only depend
//! on the request, so revalidation never touches the upstream.
//!
//! [`image_url`] builds such request URLs for clients.

pub mod cache;
pub mod config;
pub mod etag;
pub mod fetch;
pub mod format;
pub mod loader;
pub mod negotiate;
pub mod origin;
pub mod params;
pub mod proxy;
pub mod response;
pub mod transform;

pub use cache::{CacheStats, CachedImage, ImageCache};
pub use config::{ConfigError, ProxyConfig};
pub use fetch::{FetchError, Fetcher, ReqwestFetcher, Upstream};
pub use format::ImageFormat;
pub use loader::image_url;
pub use origin::{AllowedOrigins, OriginError};
pub use params::{ParamError, TransformParams};
pub use proxy::{matches_endpoint, ImageProxy, CACHE_STATUS, NEGOTIATION_ERROR};
pub use response::ImageResponse;
