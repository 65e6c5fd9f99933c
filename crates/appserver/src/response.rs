// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::Response;
pub use hyper::StatusCode;

/// Holds a [`GenericResponse`], possibly wrapped in an [`ErrResponse`].
pub type ResponseResult = Result<GenericResponse, ErrResponse>;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Wrapper that lets handlers bail out with a ready-made response using `?`.
pub struct ErrResponse(pub GenericResponse);

/// Return an empty GenericResponse.
///
/// Because this is expected to be used with CORS preflight requests, it returns a 200 response
/// instead of 204 for compatibility with Firefox.
pub fn empty() -> GenericResponse {
    let body = Empty::new().map_err(anyhow::Error::from).boxed();
    Response::new(body)
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl ToString,
) -> GenericResponse {
    let body = content.to_string().map_err(anyhow::Error::from).boxed();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

/// Return a JSON response with known content.
pub fn json(status: StatusCode, content: impl ToString) -> GenericResponse {
    let content_type = "application/json";
    full(status, content_type, content)
}

/// Return a `{"error": message}` JSON response.
pub fn json_error(status: StatusCode, message: impl ToString) -> GenericResponse {
    json(status, serde_json::json!({ "error": message.to_string() }))
}

/// Return a JSON "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

/// Erase the body type of a response produced elsewhere (event streams, images).
pub fn boxed<B>(response: Response<B>) -> GenericResponse
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    response.map(|body| body.map_err(anyhow::Error::from).boxed())
}
