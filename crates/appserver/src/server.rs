// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::response::GenericResponse;

/// Serves HTTP/1 connections while allowing for graceful shutdowns.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is the number of simultaneous connections served before new
    /// ones get a minimal 503.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_connections = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections,
            shutdown,
        }
    }

    /// Serve incoming `connections` with `responder`, one task per connection.
    ///
    /// Resolves once [`graceful_shutdown`](Self::graceful_shutdown) has been called (or
    /// `connections` is exhausted) and every connection accepted here has ended.
    /// Long-lived responses such as event streams keep their connection, and therefore
    /// the shutdown, waiting until they finish.
    ///
    /// # Cancel Safety
    ///
    /// Cancellation aborts every connection accepted by this call.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let respond = move |request: Request<Incoming>, peer_addr| {
            let responder = responder.clone();
            async move {
                info!("Request: {} {}", request.method(), request.uri());
                let response = responder(request, peer_addr).await;
                info!("Response: {}", response.status());
                response
            }
        };

        // Dropped last, so that graceful_shutdown() can't return before we do.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        async fn either<T>(f1: impl Future<Output = T>, f2: impl Future<Output = T>) -> T {
            select! {
                biased; // never accept connections once shut down
                x1 = f1 => x1,
                x2 = f2 => x2,
            }
        }

        let mut connection_tasks = JoinSet::new();

        info!("Started serving");

        // scope is only to force `connections` to be dropped
        {
            let mut connections = pin!(connections);
            while let Some(accepted) = either(&mut was_shutdown, connections.next()).await {
                let (connection, peer_addr) = match accepted {
                    Ok(a) => a,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr=%peer_addr);
                connection_span.in_scope(|| info!("Connected."));

                let Ok(permit) = self.concurrent_connections.clone().try_acquire_owned() else {
                    connection_tasks.spawn(
                        async move {
                            warn!("Too overloaded; sending minimal 503.");
                            let _ = respond_with_temporarily_unavailable(connection).await;
                            info!("Disconnected.");
                        }
                        .instrument(connection_span),
                    );
                    continue;
                };

                let respond = respond.clone();
                let service = service_fn(move |r| respond(r, peer_addr).map(Ok::<_, Infallible>));
                let mut shutdown_receiver = self.shutdown.subscribe();
                let connection_task = async move {
                    let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                    let _permit = permit;

                    let http_connection = http1::Builder::new()
                        .half_close(true)
                        .serve_connection(TokioIo::new(connection), service);
                    if let Err(err) = with_graceful_shutdown(http_connection, wants_shutdown).await
                    {
                        error!("Error serving: {err}");
                    }
                    info!("Disconnected.");
                };
                connection_tasks.spawn(connection_task.instrument(connection_span));

                // Reap finished connections so the set doesn't grow without bound.
                while connection_tasks.try_join_next().is_some() {}
            }
        }

        while connection_tasks.join_next().await.is_some() {}
        info!("Stopped serving");
    }

    /// Gracefully shuts down server.
    ///
    /// Running [`serve`](Self::serve) calls stop accepting connections, and each connection
    /// ends after its current response. Resolves once all of them have returned.
    ///
    /// # Cancel Safety
    ///
    /// After this has been polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // The request isn't even parsed, and a slow client only gets one second.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and shutting down both need exclusive access to the connection.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use http_body_util::BodyExt;
    use hyper::Response;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn smoke_test() {
        let (connections_tx, mut connections_rx) = mpsc::channel(4);
        let connections = futures::stream::poll_fn(|cx| connections_rx.poll_recv(cx));

        let server = Server::new(2);
        let run = server.serve(connections, |request, _| async {
            let body = request.into_body().map_err(|err| err.into()).boxed();
            Response::new(body)
        });

        let test = async {
            let (mut client, server_side) = tokio::io::duplex(1024);
            let address = SocketAddr::from(([127, 0, 0, 1], 8080));
            connections_tx.send(Ok((server_side, address))).await.unwrap();

            let msg =
                b"POST / HTTP/1.1\r\nHost: foo.com\r\nContent-Length: 13\r\n\r\nHello, world!";
            client.write_all(msg).await.unwrap();
            client.shutdown().await.unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 "));
            assert!(response.ends_with("\r\n\r\nHello, world!"));
        };

        tokio::select! {
            _ = run => panic!("server stopped unexpectedly"),
            _ = test => {}
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn shutdown_servers_do_not_accept_connections() {
        let address = SocketAddr::from(([127, 0, 0, 1], 8080));
        let mut connection_accepted = false;
        let connections = futures::stream::once(async {
            connection_accepted = true;
            Ok((Cursor::new(vec![]), address))
        });

        let server = Server::new(2);
        server.graceful_shutdown().await;

        server
            .serve(connections, |_, _| async { unimplemented!() })
            .await;
        assert!(!connection_accepted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn overloaded_servers_respond_with_503() {
        let (c0, s0) = tokio::io::duplex(1024);
        let (mut c1, s1) = tokio::io::duplex(1024);
        let address = SocketAddr::from(([127, 0, 0, 1], 8080));
        let accepted = [Ok::<_, std::io::Error>((s0, address)), Ok((s1, address))];
        let connections = futures::stream::iter(accepted).chain(futures::stream::pending());

        let server = Server::new(1);
        let run = server.serve(connections, |_, _| futures::future::pending());

        let test = async {
            let mut response = String::new();
            c1.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 503"));
            assert!(response.ends_with("Too many connections!\n"));
            drop(c0);
        };

        tokio::select! {
            _ = run => panic!("server stopped unexpectedly"),
            _ = test => {}
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn graceful_shutdown_waits_for_connections() {
        let (mut client, server_side) = tokio::io::duplex(1024);
        let address = SocketAddr::from(([127, 0, 0, 1], 8080));
        let accepted = [Ok::<_, std::io::Error>((server_side, address))];
        let connections = futures::stream::iter(accepted).chain(futures::stream::pending());

        let server = Server::new(2);
        let run = server.serve(connections, |_, _| async {
            sleep(Duration::from_millis(50)).await;
            crate::response::empty()
        });

        let test = async {
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: foo.com\r\n\r\n")
                .await
                .unwrap();
            // Let the request reach the responder before shutting down.
            sleep(Duration::from_millis(10)).await;
            server.graceful_shutdown().await;

            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 "));
        };

        tokio::join!(run, test);
    }
}
