// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The [`hyper`] body that carries a session's frames

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame};
use tokio::sync::mpsc;

use crate::abort::AbortSignal;
use crate::error::StreamError;

pub(crate) type FrameSender = mpsc::UnboundedSender<Result<Bytes, StreamError>>;

/// Response body of a stream.
///
/// Yields one data frame per emitted event. It ends when the session closes, or
/// yields a [`StreamError`] when the producer failed, which makes the server
/// abort the connection instead of finishing the response.
///
/// Dropping the body (e.g. because the client disconnected) aborts the session.
pub struct EventBody {
    frames: mpsc::UnboundedReceiver<Result<Bytes, StreamError>>,
    abort: AbortSignal,
}

impl EventBody {
    pub(crate) fn channel(abort: AbortSignal) -> (FrameSender, Self) {
        let (sender, frames) = mpsc::unbounded_channel();
        (sender, Self { frames, abort })
    }
}

impl Body for EventBody {
    type Data = Bytes;
    type Error = StreamError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Poll::Ready(match ready!(this.frames.poll_recv(cx)) {
            Some(Ok(bytes)) => Some(Ok(Frame::data(bytes))),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        })
    }
}

impl Drop for EventBody {
    fn drop(&mut self) {
        if self.abort.abort() {
            tracing::debug!("Event stream body dropped before the session closed.");
        }
    }
}
