// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding and decoding of individual wire frames

use std::string::FromUtf8Error;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::InvalidEventName;

/// Event name used by receivers when a frame has no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

/// Checks that `name` fits on a single line of the wire format.
pub fn check_event_name(name: &str) -> Result<(), InvalidEventName> {
    if name.contains(['\n', '\r']) {
        return Err(InvalidEventName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

/// Serializes one frame.
///
/// `data` must already be JSON; compact JSON never contains raw line breaks.
pub fn encode_frame(id: u64, name: &str, data: &str) -> Result<Bytes, InvalidEventName> {
    check_event_name(name)?;
    debug_assert!(!data.contains('\n'), "frame data must be a single line");

    let mut buf = BytesMut::with_capacity(32 + name.len() + data.len());
    buf.put_slice(b"id: ");
    buf.put_slice(id.to_string().as_bytes());
    buf.put_slice(b"\nevent: ");
    buf.put_slice(name.as_bytes());
    buf.put_slice(b"\ndata: ");
    buf.put_slice(data.as_bytes());
    buf.put_slice(b"\n\n");
    Ok(buf.freeze())
}

/// A frame as it was received, before being interpreted as a typed event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub id: Option<u64>,
    pub event: String,
    pub data: String,
}

#[derive(Default)]
struct PendingFrame {
    id: Option<u64>,
    event: Option<String>,
    data: Option<String>,
}

impl PendingFrame {
    fn take(&mut self) -> Option<RawFrame> {
        let pending = std::mem::take(self);
        let data = pending.data?;
        Some(RawFrame {
            id: pending.id,
            event: pending.event.unwrap_or_else(|| DEFAULT_EVENT.to_owned()),
            data,
        })
    }
}

/// Incremental parser for event-stream bodies.
///
/// Chunks may split frames (or lines) anywhere; [`feed`](Self::feed) them as they arrive
/// and drain complete frames with [`next_frame`](Self::next_frame). Lines may end with
/// `\n` or `\r\n`. Comment lines (starting with `:`) and unknown fields are skipped, and
/// consecutive `data:` lines are joined with `\n`.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    pending: PendingFrame,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, if one has been fully received.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FromUtf8Error> {
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)?;

            if line.is_empty() {
                if let Some(frame) = self.pending.take() {
                    return Ok(Some(frame));
                }
                continue;
            }
            self.process_line(&line);
        }
        Ok(None)
    }

    /// Whether bytes of an unfinished frame are still buffered.
    ///
    /// Per the event-stream format, an unterminated frame at the end of a body is dropped.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || self.pending.data.is_some()
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.pending.id = value.parse().ok(),
            "event" => self.pending.event = Some(value.to_owned()),
            "data" => match &mut self.pending.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.pending.data = Some(value.to_owned()),
            },
            _ => {}
        }
    }
}
