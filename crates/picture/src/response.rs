// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use http_body_util::Full;

/// Every proxy response has its body fully in memory.
pub type ImageResponse = Response<Full<Bytes>>;

/// Return a bodiless response.
pub fn empty(status: StatusCode) -> ImageResponse {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}

/// Return a `{"error": message}` JSON response.
pub fn json_error(status: StatusCode, message: impl ToString) -> ImageResponse {
    let body = serde_json::json!({ "error": message.to_string() }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
