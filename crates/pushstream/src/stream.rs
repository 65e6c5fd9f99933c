// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turning a producer into a streaming [`hyper`] response

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use tracing::error;

use crate::abort::AbortSignal;
use crate::body::EventBody;
use crate::emitter::{Cleanup, Emitter, Heartbeat, Session};
use crate::event::Events;

/// What a producer resolves to: an optional cleanup to run when the session closes.
pub type ProducerResult = anyhow::Result<Option<Cleanup>>;

/// Code that writes events to a freshly opened session.
///
/// Implemented for every `FnOnce(Emitter<E>) -> impl Future<Output = ProducerResult>`.
/// The producer is invoked exactly once, right after the response has been created,
/// and may keep emitting (through clones of the emitter) long after it returned.
pub trait Producer<E: Events>: Send + 'static {
    fn produce(self, emitter: Emitter<E>) -> BoxFuture<'static, ProducerResult>;
}

impl<E, F, Fut> Producer<E> for F
where
    E: Events,
    F: FnOnce(Emitter<E>) -> Fut + Send + 'static,
    Fut: Future<Output = ProducerResult> + Send + 'static,
{
    fn produce(self, emitter: Emitter<E>) -> BoxFuture<'static, ProducerResult> {
        self(emitter).boxed()
    }
}

#[derive(Debug, Default)]
pub struct StreamOptions {
    pub heartbeat: Heartbeat,
    /// Caller-owned signal, linked to the session's own signal in both directions.
    pub abort: Option<AbortSignal>,
    pub status: StatusCode,
    /// Extra response headers; these override the event-stream defaults.
    pub headers: HeaderMap,
}

/// Starts `producer` on a new session and returns the response that carries it.
///
/// The response is returned before the producer has emitted anything. If the producer
/// fails (or panics), its registered cleanup runs, the failure is logged, and the body
/// ends with a [`StreamError`](crate::StreamError) so that the connection is aborted.
///
/// Must be called from within a [`tokio`] runtime.
pub fn stream<E: Events>(
    producer: impl Producer<E>,
    options: StreamOptions,
) -> Response<EventBody> {
    let StreamOptions {
        heartbeat,
        abort: external,
        status,
        headers,
    } = options;

    let abort = AbortSignal::new();
    if let Some(external) = &external {
        abort.link(external);
    }
    let (session, body) = Session::open(abort, heartbeat);
    let emitter = Emitter::new(session.clone());

    tokio::spawn(async move {
        let run = async move { producer.produce(emitter.clone()).await.map(|c| (c, emitter)) };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok((Some(cleanup), emitter))) => emitter.on_cleanup(cleanup).await,
            Ok(Ok((None, _))) => {}
            Ok(Err(err)) => {
                error!("Event producer failed: {err:#}");
                session.fail(format!("{err:#}")).await;
            }
            Err(_) => {
                error!("Event producer panicked.");
                session.fail("producer panicked".to_owned()).await;
            }
        }
    });

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response_headers.extend(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use http_body_util::BodyExt;

    use crate::error::StreamError;
    use crate::event::NamedEvent;

    async fn collect(body: EventBody) -> Result<String, StreamError> {
        let bytes = body.collect().await?.to_bytes();
        Ok(String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn counted_cleanup(runs: &Arc<AtomicUsize>) -> Cleanup {
        let runs = runs.clone();
        Cleanup::sync(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn sets_event_stream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-stream", HeaderValue::from_static("counter"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

        let response = stream(
            |emitter: Emitter<NamedEvent>| async move {
                emitter.close().await;
                ProducerResult::Ok(None)
            },
            StreamOptions {
                status: StatusCode::ACCEPTED,
                headers,
                ..Default::default()
            },
        );

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[CONNECTION], "keep-alive");
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()["x-stream"], "counter");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn producer_may_keep_emitting_after_returning() {
        let response = stream(
            |emitter: Emitter<NamedEvent>| async move {
                tokio::spawn(async move {
                    for i in 0..3 {
                        emitter.emit(NamedEvent::new("increment", i)).unwrap();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    emitter.close().await;
                });
                ProducerResult::Ok(None)
            },
            StreamOptions::default(),
        );

        assert_eq!(
            collect(response.into_body()).await.unwrap(),
            "id: 1\nevent: increment\ndata: 0\n\n\
             id: 2\nevent: increment\ndata: 1\n\n\
             id: 3\nevent: increment\ndata: 2\n\n"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn returned_cleanup_runs_on_close() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (emitter_tx, emitter_rx) = tokio::sync::oneshot::channel::<Emitter<NamedEvent>>();

        let response = stream(
            {
                let runs = runs.clone();
                move |emitter: Emitter<NamedEvent>| async move {
                    let _ = emitter_tx.send(emitter);
                    ProducerResult::Ok(Some(counted_cleanup(&runs)))
                }
            },
            StreamOptions::default(),
        );

        let emitter = emitter_rx.await.unwrap();
        // Give the session a moment to register the returned cleanup.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        emitter.close().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(collect(response.into_body()).await.unwrap(), "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failing_producer_breaks_the_body_and_cleans_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let response = stream(
            {
                let runs = runs.clone();
                move |emitter: Emitter<NamedEvent>| async move {
                    emitter.on_cleanup(counted_cleanup(&runs)).await;
                    emitter.emit(NamedEvent::new("partial", 1))?;
                    ProducerResult::Err(anyhow::anyhow!("database unavailable"))
                }
            },
            StreamOptions::default(),
        );

        let err = collect(response.into_body()).await.unwrap_err();
        assert_eq!(err, StreamError::Producer("database unavailable".into()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn panicking_producer_is_a_failure() {
        let response = stream(
            |_emitter: Emitter<NamedEvent>| async move {
                if true {
                    panic!("oops");
                }
                ProducerResult::Ok(None)
            },
            StreamOptions::default(),
        );
        assert!(collect(response.into_body()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn external_abort_closes_the_session() {
        let abort = AbortSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let response = stream(
            {
                let runs = runs.clone();
                move |emitter: Emitter<NamedEvent>| async move {
                    emitter.emit(NamedEvent::new("started", true))?;
                    emitter.on_cleanup(counted_cleanup(&runs)).await;
                    ProducerResult::Ok(None)
                }
            },
            StreamOptions {
                heartbeat: Heartbeat::Disabled,
                abort: Some(abort.clone()),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.abort();
        assert_eq!(
            collect(response.into_body()).await.unwrap(),
            "id: 1\nevent: started\ndata: true\n\n"
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
