// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query parameters of transform requests

use std::borrow::Cow;
use std::time::Duration;

use http::StatusCode;
use percent_encoding::percent_decode_str;

use crate::format::ImageFormat;

/// Validated parameters of a transform request.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformParams {
    /// Source URL, exactly as requested (not yet resolved or checked against origins).
    pub url: String,
    /// Target width; `None` keeps the source width.
    pub width: Option<u32>,
    pub quality: u8,
    /// Explicitly requested format, overriding `Accept` negotiation.
    pub format: Option<ImageFormat>,
    /// Artificial latency, only honored outside of production.
    pub delay: Option<Duration>,
}

/// Rejected query parameters. Messages are shown to API clients as-is.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("Missing image url")]
    MissingUrl,
    #[error("Invalid image url")]
    InvalidUrl,
    #[error("Invalid image width")]
    InvalidWidth,
    #[error("Image width must be positive and lower than {max}")]
    WidthOutOfRange { max: u32 },
    #[error("Invalid image quality")]
    InvalidQuality,
    #[error("Expected image quality between 0 and 100")]
    QualityOutOfRange,
}

impl ParamError {
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

/// First non-empty value of `key`, mirroring how browsers read search params.
fn param<'a>(pairs: &'a [(Cow<'a, str>, Cow<'a, str>)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_ref())
        .filter(|v| !v.is_empty())
}

impl TransformParams {
    /// Parses and validates a request's query string.
    ///
    /// Validation stops at the first invalid parameter, checking `url`, then `width`,
    /// then `quality`. Unknown `format` values are ignored and an unparseable `delay`
    /// is treated as absent.
    pub fn from_query(
        query: Option<&str>,
        max_width: u32,
        default_quality: u8,
    ) -> Result<Self, ParamError> {
        let pairs: Vec<_> = form_urlencoded::parse(query.unwrap_or("").as_bytes()).collect();

        let url = param(&pairs, "url").ok_or(ParamError::MissingUrl)?;
        // Loaders encode the URL once more on top of the query string encoding.
        let url = percent_decode_str(url)
            .decode_utf8()
            .map_err(|_| ParamError::InvalidUrl)?
            .into_owned();

        let width = param(&pairs, "width")
            .map(|width| parse_width(width, max_width))
            .transpose()?;
        let quality = param(&pairs, "quality")
            .map(parse_quality)
            .transpose()?
            .unwrap_or(default_quality);
        let format = param(&pairs, "format").and_then(|format| format.parse().ok());
        let delay = param(&pairs, "delay").and_then(parse_delay);

        Ok(Self {
            url,
            width,
            quality,
            format,
            delay,
        })
    }
}

fn parse_width(width: &str, max_width: u32) -> Result<u32, ParamError> {
    let width: f64 = width.trim().parse().map_err(|_| ParamError::InvalidWidth)?;
    if width.is_nan() {
        return Err(ParamError::InvalidWidth);
    }
    if width <= 0.0 || width > f64::from(max_width) {
        return Err(ParamError::WidthOutOfRange { max: max_width });
    }
    // In range, so this neither truncates nor reaches zero.
    Ok(width.ceil() as u32)
}

fn parse_quality(quality: &str) -> Result<u8, ParamError> {
    let quality: i64 = quality
        .trim()
        .parse()
        .map_err(|_| ParamError::InvalidQuality)?;
    u8::try_from(quality)
        .ok()
        .filter(|quality| *quality <= 100)
        .ok_or(ParamError::QualityOutOfRange)
}

fn parse_delay(delay: &str) -> Option<Duration> {
    let millis: f64 = delay.trim().parse().ok()?;
    if millis <= 0.0 {
        return None;
    }
    // Rejects NaN as well as values beyond what a `Duration` can hold.
    Duration::try_from_secs_f64(millis / 1000.0).ok()
}
