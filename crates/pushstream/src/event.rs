// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed events carried by a stream

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Name of the heartbeat frames emitted by the session itself.
pub const PING_EVENT: &str = "ping";

/// The closed set of events one kind of stream may carry.
///
/// Implementations are usually an enum with one variant per event name, which gives
/// producers and consumers exhaustive matching over everything the stream can say.
/// [`PING_EVENT`] is reserved and must not be used as a name.
pub trait Events: Sized + Send + 'static {
    /// Wire name of this event.
    fn name(&self) -> &str;

    /// JSON encoding of this event's payload.
    fn data(&self) -> serde_json::Result<String>;

    /// Rebuilds an event from its wire name and JSON payload.
    fn decode(name: &str, data: &str) -> Result<Self, DecodeError>;
}

/// An event with an arbitrary name and untyped payload.
///
/// Useful for ad-hoc producers that don't warrant their own [`Events`] enum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedEvent {
    pub name: String,
    pub value: serde_json::Value,
}

impl NamedEvent {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Events for NamedEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn data(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.value)
    }

    fn decode(name: &str, data: &str) -> Result<Self, DecodeError> {
        let value = serde_json::from_str(data).map_err(|e| DecodeError::payload(name, e))?;
        Ok(Self {
            name: name.to_owned(),
            value,
        })
    }
}
