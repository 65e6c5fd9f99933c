// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Indicates an event name that can't be represented on the line-delimited wire format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event name cannot include line breaks: {name:?}")]
pub struct InvalidEventName {
    pub name: String,
}

/// Errors returned by [`Emitter::emit`](crate::Emitter::emit).
///
/// Emitting on a closed session is not an error; it is silently ignored.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    InvalidName(#[from] InvalidEventName),
    #[error("could not serialize {name:?} payload: {source}")]
    Serialize {
        name: String,
        source: serde_json::Error,
    },
}

/// Error produced by an [`EventBody`](crate::EventBody).
///
/// This only happens when a producer fails before closing its session, and it is
/// meant to make the HTTP server abort the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("event producer failed: {0}")]
    Producer(String),
}

/// Failure to turn a received frame back into a typed event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected event {0:?}")]
    UnknownEvent(String),
    #[error("invalid payload for event {name:?}: {source}")]
    Payload {
        name: String,
        source: serde_json::Error,
    },
}

impl DecodeError {
    pub fn payload(name: &str, source: serde_json::Error) -> Self {
        Self::Payload {
            name: name.to_owned(),
            source,
        }
    }
}

/// Errors reported to [`ConsumeOptions::on_error`](crate::ConsumeOptions::on_error).
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("while requesting {url}: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("http error: {status}")]
    Status { status: u16 },
    #[error("connection to {url} broke: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("received a malformed stream: {0}")]
    Malformed(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("stream ended before reporting an outcome")]
    Incomplete,
    #[error("stream was aborted")]
    Aborted,
}
