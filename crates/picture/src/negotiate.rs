// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Accept` header handling

use crate::format::ImageFormat;

/// Media types listed in an `Accept` header, without their parameters.
fn media_types(accept: &str) -> impl Iterator<Item = &str> {
    accept
        .split(',')
        .filter_map(|entry| entry.split(';').next())
        .map(str::trim)
        .filter(|media_type| !media_type.is_empty())
}

/// Whether the client asked for any image type at all.
pub fn accepts_images(accept: Option<&str>) -> bool {
    accept.is_some_and(|accept| {
        media_types(accept).any(|media_type| {
            media_type
                .get(..6)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"))
        })
    })
}

/// Picks the first of `formats` that the `Accept` header allows.
///
/// `image/*` allows every configured format. Quality weights are ignored, so the
/// configured priority order always decides between acceptable formats.
pub fn negotiate(accept: Option<&str>, formats: &[ImageFormat]) -> Option<ImageFormat> {
    let accept = accept?;
    if media_types(accept).any(|media_type| media_type.eq_ignore_ascii_case("image/*")) {
        return formats.first().copied();
    }
    formats.iter().copied().find(|format| {
        media_types(accept).any(|media_type| media_type.eq_ignore_ascii_case(format.mime_type()))
    })
}
