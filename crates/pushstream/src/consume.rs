// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client side: reading a stream response into typed callbacks

use bytes::Bytes;
use futures::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use tracing::{debug, trace};

use crate::abort::AbortSignal;
use crate::error::ConsumeError;
use crate::event::{Events, PING_EVENT};
use crate::frame::{FrameDecoder, RawFrame};

/// How the stream request is made. Shared by [`ConsumeOptions`] and
/// [`ExecuteOptions`](crate::ExecuteOptions).
#[derive(Clone, Debug)]
pub(crate) struct RequestSettings {
    pub method: Method,
    pub body: Option<Bytes>,
    pub headers: HeaderMap,
    pub client: Option<reqwest::Client>,
    pub abort: Option<AbortSignal>,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            method: Method::POST,
            body: None,
            headers: HeaderMap::new(),
            client: None,
            abort: None,
        }
    }
}

impl RequestSettings {
    pub fn json<T: Serialize + ?Sized>(&mut self, body: &T) -> serde_json::Result<()> {
        self.body = Some(serde_json::to_vec(body)?.into());
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(())
    }
}

type Callback<A> = Box<dyn FnMut(A) + Send>;

/// Request settings and callbacks for [`consume`].
///
/// Requests default to `POST` with no body. Exactly one of `on_close` (clean end of
/// the body) and `on_error` runs per call to [`consume`].
pub struct ConsumeOptions<E> {
    pub(crate) request: RequestSettings,
    on_open: Option<Callback<StatusCode>>,
    on_message: Option<Box<dyn FnMut(&RawFrame) + Send>>,
    on_data: Option<Callback<E>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(ConsumeError) + Send>>,
}

impl<E> Default for ConsumeOptions<E> {
    fn default() -> Self {
        Self {
            request: RequestSettings::default(),
            on_open: None,
            on_message: None,
            on_data: None,
            on_close: None,
            on_error: None,
        }
    }
}

impl<E: Events> ConsumeOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.request.method = method;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Some(body.into());
        self
    }

    /// Sends `body` as JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> serde_json::Result<Self> {
        self.request.json(body)?;
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.request.client = Some(client);
        self
    }

    /// Links an external signal; aborting it cancels the request.
    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.request.abort = Some(signal);
        self
    }

    pub fn on_open(mut self, f: impl FnMut(StatusCode) + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Called with every frame except heartbeats, before it is decoded.
    pub fn on_message(mut self, f: impl FnMut(&RawFrame) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_data(mut self, f: impl FnMut(E) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(ConsumeError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn dispatch(&mut self, frame: RawFrame) -> Result<(), ConsumeError> {
        if frame.event == PING_EVENT {
            trace!("Heartbeat {:?}", frame.id);
            return Ok(());
        }
        if let Some(on_message) = &mut self.on_message {
            on_message(&frame);
        }
        let event = E::decode(&frame.event, &frame.data)?;
        if let Some(on_data) = &mut self.on_data {
            on_data(event);
        }
        Ok(())
    }
}

/// Cancels the request started by [`consume`].
#[derive(Clone, Debug)]
pub struct Cancel {
    abort: AbortSignal,
}

impl Cancel {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

/// Requests `url` and dispatches the response's frames to `options`' callbacks.
///
/// The request runs in a background task. Returns `None` (and does nothing) when
/// called outside of a [`tokio`] runtime.
///
/// A non-2xx status is reported as [`ConsumeError::Status`] without reading the body.
/// Cancelling (through [`Cancel`] or the caller's abort signal) reports
/// [`ConsumeError::Aborted`].
pub fn consume<E: Events>(url: impl Into<String>, options: ConsumeOptions<E>) -> Option<Cancel> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let abort = AbortSignal::new();
    // Finishing or cancelling this request leaves the caller's signal untouched.
    if let Some(external) = &options.request.abort {
        abort.follow(external);
    }
    runtime.spawn(run(url.into(), options, abort.clone()));
    Some(Cancel { abort })
}

async fn run<E: Events>(url: String, mut options: ConsumeOptions<E>, abort: AbortSignal) {
    let result = tokio::select! {
        biased;
        _ = abort.aborted() => Err(ConsumeError::Aborted),
        result = read(&url, &mut options) => result,
    };
    abort.abort();

    match result {
        Ok(()) => {
            debug!("Stream from {url} ended.");
            if let Some(on_close) = options.on_close.take() {
                on_close();
            }
        }
        Err(err) => {
            debug!("Stream from {url} failed: {err}");
            if let Some(on_error) = options.on_error.take() {
                on_error(err);
            }
        }
    }
}

async fn read<E: Events>(url: &str, options: &mut ConsumeOptions<E>) -> Result<(), ConsumeError> {
    let request = &options.request;
    let mut headers = request.headers.clone();
    headers
        .entry(ACCEPT)
        .or_insert(HeaderValue::from_static("text/event-stream"));

    let client = request.client.clone().unwrap_or_default();
    let mut builder = client.request(request.method.clone(), url).headers(headers);
    if let Some(body) = request.body.clone() {
        builder = builder.body(body);
    }
    let response = builder.send().await.map_err(|source| ConsumeError::Request {
        url: url.to_owned(),
        source,
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ConsumeError::Status {
            status: status.as_u16(),
        });
    }
    if let Some(on_open) = &mut options.on_open {
        on_open(status);
    }

    let mut decoder = FrameDecoder::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|source| ConsumeError::Transport {
            url: url.to_owned(),
            source,
        })?;
        decoder.feed(&chunk);
        while let Some(frame) = decoder
            .next_frame()
            .map_err(|e| ConsumeError::Malformed(e.to_string()))?
        {
            options.dispatch(frame)?;
        }
    }
    if decoder.has_partial() {
        debug!("Dropping unterminated frame at the end of {url}.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::event::NamedEvent;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Open(u16),
        Message(String),
        Data(NamedEvent),
        Close,
        Error(String),
    }

    /// Serves `body` with `status` to every request, recording the method used.
    async fn serve(
        status: StatusCode,
        body: &'static str,
    ) -> (SocketAddr, Arc<Mutex<Vec<Method>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let methods = Arc::new(Mutex::new(vec![]));
        let seen_methods = methods.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let methods = seen_methods.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                        methods.lock().unwrap().push(request.method().clone());
                        let body = Full::new(Bytes::from_static(body.as_bytes()));
                        let mut response = Response::new(body);
                        *response.status_mut() = status;
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, methods)
    }

    fn recording(
        log: &Arc<Mutex<Vec<Seen>>>,
        done: oneshot::Sender<()>,
    ) -> ConsumeOptions<NamedEvent> {
        let (open, message, data, close, error) =
            (log.clone(), log.clone(), log.clone(), log.clone(), log.clone());
        let done = Arc::new(Mutex::new(Some(done)));
        let done_on_error = done.clone();
        ConsumeOptions::new()
            .on_open(move |status| open.lock().unwrap().push(Seen::Open(status.as_u16())))
            .on_message(move |frame| {
                message
                    .lock()
                    .unwrap()
                    .push(Seen::Message(frame.event.clone()))
            })
            .on_data(move |event| data.lock().unwrap().push(Seen::Data(event)))
            .on_close(move || {
                close.lock().unwrap().push(Seen::Close);
                let _ = done.lock().unwrap().take().unwrap().send(());
            })
            .on_error(move |err| {
                error.lock().unwrap().push(Seen::Error(err.to_string()));
                let _ = done_on_error.lock().unwrap().take().unwrap().send(());
            })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn dispatches_frames_and_skips_heartbeats() {
        let (addr, methods) = serve(
            StatusCode::OK,
            "id: 1\nevent: increment\ndata: 0\n\n\
             id: 2\nevent: ping\ndata: \"\"\n\n\
             id: 3\nevent: increment\ndata: 1\n\n",
        )
        .await;
        let log = Arc::new(Mutex::new(vec![]));
        let (done_tx, done_rx) = oneshot::channel();

        consume(format!("http://{addr}/api/stream"), recording(&log, done_tx)).unwrap();
        done_rx.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Seen::Open(200),
                Seen::Message("increment".into()),
                Seen::Data(NamedEvent::new("increment", 0)),
                Seen::Message("increment".into()),
                Seen::Data(NamedEvent::new("increment", 1)),
                Seen::Close,
            ]
        );
        assert_eq!(*methods.lock().unwrap(), vec![Method::POST]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn non_success_status_is_an_error() {
        let (addr, _) = serve(StatusCode::NOT_FOUND, "{\"error\":\"Not found\"}").await;
        let log = Arc::new(Mutex::new(vec![]));
        let (done_tx, done_rx) = oneshot::channel();

        consume(format!("http://{addr}/missing"), recording(&log, done_tx)).unwrap();
        done_rx.await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![Seen::Error("http error: 404".into())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn undecodable_payloads_stop_the_stream() {
        let (addr, _) = serve(
            StatusCode::OK,
            "event: increment\ndata: not json\n\nevent: increment\ndata: 2\n\n",
        )
        .await;
        let log = Arc::new(Mutex::new(vec![]));
        let (done_tx, done_rx) = oneshot::channel();

        consume(format!("http://{addr}/"), recording(&log, done_tx).method(Method::GET)).unwrap();
        done_rx.await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3, "{log:?}");
        assert!(matches!(&log[2], Seen::Error(e) if e.contains("invalid payload")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn cancelling_reports_aborted() {
        let signal = AbortSignal::new();
        signal.abort();
        let log = Arc::new(Mutex::new(vec![]));
        let (done_tx, done_rx) = oneshot::channel();

        // Nothing listens on port 9 of the loopback interface; the abort wins anyway.
        let options = recording(&log, done_tx).abort_signal(signal);
        let cancel = consume("http://127.0.0.1:9/", options).unwrap();
        done_rx.await.unwrap();

        assert!(cancel.signal().is_aborted());
        assert_eq!(*log.lock().unwrap(), vec![Seen::Error("stream was aborted".into())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn finished_streams_leave_the_callers_signal_alone() {
        let (addr, _) = serve(StatusCode::OK, "event: increment\ndata: 0\n\n").await;
        let shared = AbortSignal::new();
        let log = Arc::new(Mutex::new(vec![]));
        let (done_tx, done_rx) = oneshot::channel();

        let options = recording(&log, done_tx).abort_signal(shared.clone());
        let cancel = consume(format!("http://{addr}/"), options).unwrap();
        done_rx.await.unwrap();

        assert_eq!(log.lock().unwrap().last(), Some(&Seen::Close));
        assert!(cancel.signal().is_aborted());
        assert!(!shared.is_aborted());
    }

    #[test]
    fn without_a_runtime_nothing_happens() {
        let options = ConsumeOptions::<NamedEvent>::new().on_error(|_| panic!("must not run"));
        assert!(consume("http://127.0.0.1:9/", options).is_none());
    }
}
