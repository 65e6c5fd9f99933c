// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Overview
//!
//! The [`pushstream`](crate) crate multiplexes typed server-push events over a single
//! long-lived HTTP response body, and provides the client counterpart that turns
//! those bodies back into typed callbacks.
//!
//! On the server, [`stream()`] hands an [`Emitter`] to a [`Producer`] and immediately
//! returns a [`hyper`] response whose body carries every emitted event. [`task()`] is
//! built on top of it and models "run one action, report exactly one outcome".
//!
//! On the client, [`consume()`] opens the request with [`reqwest`] and dispatches frames
//! to [`ConsumeOptions`] callbacks; [`execute()`] mirrors [`task()`] by resolving to the
//! task's value or failing with a [`TaskError`].
//!
//! # Format
//!
//! Bodies are Server-Sent-Events compatible. Every event is one frame:
//!
//! ```text
//! id: 1
//! event: success
//! data: 42
//!
//! ```
//!
//! `id` increases by one per frame and starts over for every response. `data` is the
//! JSON encoding of the event's payload. Event names may not contain line breaks.
//! Heartbeats are frames named `ping` with an empty-string payload; they carry no
//! meaning and consumers drop them.
//!
//! # Design Tidbits
//!
//! Frames are never buffered or replayed. Each [`Emitter::emit`] produces exactly one
//! body frame, so the transport may flush them as they are produced. There is no
//! resumption via `Last-Event-ID`.
//!
//! A producer that fails before closing its session breaks the connection instead of
//! ending the body cleanly, so clients can tell a crashed producer from a finished one.
//! Failures meant for the user should be emitted as events instead (see [`task()`]).

pub mod abort;
pub mod body;
pub mod consume;
pub mod emitter;
pub mod error;
pub mod event;
pub mod execute;
pub mod frame;
pub mod stream;
pub mod task;

pub use abort::AbortSignal;
pub use body::EventBody;
pub use consume::{consume, Cancel, ConsumeOptions};
pub use emitter::{Cleanup, Emitter, Heartbeat, InvalidHeartbeat, DEFAULT_HEARTBEAT};
pub use error::{ConsumeError, DecodeError, EmitError, InvalidEventName, StreamError};
pub use event::{Events, NamedEvent, PING_EVENT};
pub use execute::{execute, ExecuteError, ExecuteOptions};
pub use frame::RawFrame;
pub use stream::{stream, Producer, ProducerResult, StreamOptions};
pub use task::{task, TaskError, TaskEvent, TaskOptions, TaskOutcome, TaskState};
