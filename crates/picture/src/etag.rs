// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entity tags of transformed images

use sha2::{Digest, Sha256};

use crate::format::ImageFormat;

/// Computes the (quoted, strong) entity tag of a transform.
///
/// This only depends on its arguments, so it can be checked against `If-None-Match`
/// before anything is fetched. Changing `cache_id` changes every tag.
pub fn etag(
    cache_id: &str,
    url: &str,
    width: Option<u32>,
    format: ImageFormat,
    quality: u8,
) -> String {
    let width = width.map(|w| w.to_string()).unwrap_or_default();
    let mut hash = Sha256::new();
    hash.update(format!("{cache_id}:{url}:{width}:{format}:{quality}"));
    format!("\"{}\"", hex::encode(hash.finalize()))
}

/// Whether an `If-None-Match` header value matches `etag`.
///
/// Handles `*`, comma-separated lists and weak (`W/`) tags, as `If-None-Match` uses
/// weak comparison.
pub fn if_none_match_matches(header: &str, etag: &str) -> bool {
    let opaque = |tag: &str| -> String {
        let tag = tag.trim();
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag.trim_matches('"').to_owned()
    };
    let expected = opaque(etag);
    header
        .split(',')
        .any(|candidate| candidate.trim() == "*" || opaque(candidate) == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    use ImageFormat::*;

    const URL: &str = "https://cdn.example/x.png";

    #[test]
    fn deterministic() {
        let tag = etag("epoch", URL, Some(100), Webp, 80);
        assert_eq!(tag, etag("epoch", URL, Some(100), Webp, 80));
        assert_eq!(tag.len(), 64 + 2);
        assert!(tag.starts_with('"') && tag.ends_with('"'));
    }

    #[test]
    fn every_field_matters() {
        let tag = etag("epoch", URL, Some(100), Webp, 80);
        let others = [
            etag("epoch2", URL, Some(100), Webp, 80),
            etag("epoch", "https://cdn.example/y.png", Some(100), Webp, 80),
            etag("epoch", URL, Some(101), Webp, 80),
            etag("epoch", URL, None, Webp, 80),
            etag("epoch", URL, Some(100), Png, 80),
            etag("epoch", URL, Some(100), Webp, 81),
        ];
        for other in others {
            assert_ne!(tag, other);
        }
    }

    #[test]
    fn matches_if_none_match_forms() {
        let tag = etag("epoch", URL, None, Avif, 80);
        assert!(if_none_match_matches(&tag, &tag));
        assert!(if_none_match_matches(&format!("W/{tag}"), &tag));
        assert!(if_none_match_matches(&format!("\"abc\", {tag}"), &tag));
        assert!(if_none_match_matches("*", &tag));
        assert!(!if_none_match_matches("\"abc\"", &tag));
        assert!(!if_none_match_matches("", &tag));
    }
}
