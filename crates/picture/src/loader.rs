// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building proxy URLs for clients

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left alone by JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// The URL under `endpoint` that serves `url` transformed.
///
/// `url` is component-encoded before being put in the query string, so the proxy
/// decodes it twice. A zero `width` or `quality` is left out.
pub fn image_url(endpoint: &str, url: &str, width: Option<u32>, quality: Option<u8>) -> String {
    let encoded = utf8_percent_encode(url, COMPONENT).to_string();
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("url", &encoded);
    if let Some(width) = width.filter(|w| *w > 0) {
        query.append_pair("width", &width.to_string());
    }
    if let Some(quality) = quality.filter(|q| *q > 0) {
        query.append_pair("quality", &quality.to_string());
    }
    format!("{endpoint}?{}", query.finish())
}
