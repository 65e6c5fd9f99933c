// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-response session state and the [`Emitter`] handle producers write through

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::abort::AbortSignal;
use crate::body::{EventBody, FrameSender};
use crate::error::{EmitError, InvalidEventName, StreamError};
use crate::event::{Events, PING_EVENT};
use crate::frame::{check_event_name, encode_frame};

/// Interval used by [`Heartbeat::default`].
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Whether (and how often) a session emits `ping` frames.
///
/// Heartbeats keep reverse proxies and serverless platforms from closing connections
/// that look idle. They do not impose any timeout themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Heartbeat {
    Disabled,
    Every(Duration),
}

/// A negative heartbeat interval was configured.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("heartbeat interval should be a positive number of milliseconds, got {0}")]
pub struct InvalidHeartbeat(pub i64);

impl Default for Heartbeat {
    fn default() -> Self {
        Self::Every(DEFAULT_HEARTBEAT)
    }
}

impl Heartbeat {
    /// Interprets a configured interval in milliseconds.
    ///
    /// `0` selects the default interval and negative values are rejected.
    pub fn from_millis(millis: i64) -> Result<Self, InvalidHeartbeat> {
        match u64::try_from(millis) {
            Err(_) => Err(InvalidHeartbeat(millis)),
            Ok(0) => Ok(Self::default()),
            Ok(millis) => Ok(Self::Every(Duration::from_millis(millis))),
        }
    }

    fn period(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Every(period) if period.is_zero() => Some(DEFAULT_HEARTBEAT),
            Self::Every(period) => Some(period),
        }
    }
}

/// Callback run exactly once when a session closes.
pub struct Cleanup(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>);

impl Cleanup {
    pub fn new<F, Fut>(cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || cleanup().boxed()))
    }

    /// Wraps a synchronous callback.
    pub fn sync(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self::new(move || async move { cleanup() })
    }

    async fn run(self) {
        if AssertUnwindSafe((self.0)()).catch_unwind().await.is_err() {
            error!("Stream cleanup panicked.");
        }
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cleanup")
    }
}

struct SessionState {
    open: bool,
    last_id: u64,
    sink: Option<FrameSender>,
    cleanup: Option<Cleanup>,
}

/// One session per HTTP response.
///
/// Owns the frame sink, the single cleanup callback and the abort signal that
/// stops the heartbeat timer. Every closing path goes through [`Session::close`]
/// or [`Session::fail`], both of which only act on the first call.
pub(crate) struct Session {
    state: Mutex<SessionState>,
    abort: AbortSignal,
}

impl Session {
    /// Opens a session writing to a fresh [`EventBody`].
    ///
    /// Must be called from within a [`tokio`] runtime.
    pub(crate) fn open(abort: AbortSignal, heartbeat: Heartbeat) -> (Arc<Self>, EventBody) {
        let (sink, body) = EventBody::channel(abort.clone());
        let session = Arc::new(Self {
            state: Mutex::new(SessionState {
                open: true,
                last_id: 0,
                sink: Some(sink),
                cleanup: None,
            }),
            abort,
        });

        // Client disconnects and external aborts close the session like close() would.
        tokio::spawn({
            let session = session.clone();
            async move {
                session.abort.aborted().await;
                session.close().await;
            }
        });

        if let Some(period) = heartbeat.period() {
            let session = session.clone();
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = session.abort.aborted() => break,
                        _ = ticks.tick() => {
                            // "ping" is a valid name, so this can't fail.
                            let _ = session.write(PING_EVENT, "\"\"");
                        }
                    }
                }
            });
        }

        (session, body)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn write(&self, name: &str, data: &str) -> Result<(), InvalidEventName> {
        let mut state = self.state();
        if !state.open {
            return Ok(());
        }
        check_event_name(name)?;
        state.last_id += 1;
        let frame = encode_frame(state.last_id, name, data)?;
        if let Some(sink) = &state.sink {
            // A closed receiver means the body was dropped; the abort path handles that.
            let _ = sink.send(Ok(frame));
        }
        Ok(())
    }

    /// Registers the cleanup, or runs it right away if the session already closed.
    async fn set_cleanup(&self, cleanup: Cleanup) {
        let cleanup = {
            let mut state = self.state();
            if state.open {
                state.cleanup = Some(cleanup);
                None
            } else {
                Some(cleanup)
            }
        };
        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
    }

    pub(crate) async fn close(&self) {
        let cleanup = {
            let mut state = self.state();
            if !state.open {
                return;
            }
            state.open = false;
            state.cleanup.take()
        };
        debug!("Closing event stream.");
        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
        self.abort.abort();
        self.state().sink.take();
    }

    /// Tears down after a producer failure, surfacing `message` as a body error.
    pub(crate) async fn fail(&self, message: String) {
        let (cleanup, sink) = {
            let mut state = self.state();
            state.open = false;
            (state.cleanup.take(), state.sink.take())
        };
        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
        if let Some(sink) = sink {
            let _ = sink.send(Err(StreamError::Producer(message)));
        }
        self.abort.abort();
    }
}

/// Handle through which a producer writes events of type `E` to its session.
///
/// Cloning is cheap and every clone writes to the same session.
pub struct Emitter<E> {
    session: Arc<Session>,
    _events: PhantomData<fn(E)>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            _events: PhantomData,
        }
    }
}

impl<E: Events> Emitter<E> {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            _events: PhantomData,
        }
    }

    /// Writes one frame carrying `event`.
    ///
    /// Does nothing once the session is closed. Fails without writing anything if the
    /// event's name contains a line break or its payload can't be serialized.
    pub fn emit(&self, event: E) -> Result<(), EmitError> {
        if !self.session.is_open() {
            return Ok(());
        }
        let name = event.name();
        let data = event.data().map_err(|source| EmitError::Serialize {
            name: name.to_owned(),
            source,
        })?;
        self.session.write(name, &data)?;
        Ok(())
    }

    /// Closes the session; later calls (and emits) do nothing.
    ///
    /// The registered cleanup runs to completion before the body ends.
    pub async fn close(&self) {
        self.session.close().await
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Registers the session's cleanup, replacing any previous one.
    ///
    /// If the session already closed, `cleanup` runs immediately instead.
    pub async fn on_cleanup(&self, cleanup: Cleanup) {
        self.session.set_cleanup(cleanup).await
    }

    /// Signal triggered when the session ends for any reason, including client disconnects.
    pub fn abort_signal(&self) -> AbortSignal {
        self.session.abort.clone()
    }
}
