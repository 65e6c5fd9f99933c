// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fetching source images

use bytes::{Bytes, BytesMut};
use http::header::{ACCEPT, ETAG};
use http::StatusCode;
use reqwest::redirect::Policy;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("while requesting {url}: {source}")]
    Request { url: Url, source: reqwest::Error },
    #[error("{url} is larger than {limit} bytes")]
    TooLarge { url: Url, limit: usize },
}

/// What the upstream answered.
///
/// `bytes` is only filled in for successful responses.
#[derive(Clone, Debug)]
pub struct Upstream {
    pub status: StatusCode,
    pub etag: Option<String>,
    pub bytes: Bytes,
}

/// Upstream HTTP access used by [`ImageProxy`](crate::ImageProxy).
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Requests `url`; non-success statuses are returned, not raised.
    async fn fetch(&self, url: &Url) -> Result<Upstream, FetchError>;
}

/// [`Fetcher`] backed by [`reqwest`].
///
/// Sends `Accept: image/*`, does not follow redirects (a redirect could leave the
/// allow-listed origins) and refuses bodies larger than `max_bytes`.
#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl ReqwestFetcher {
    pub fn new(max_bytes: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        Ok(Self::with_client(client, max_bytes))
    }

    pub fn with_client(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url) -> Result<Upstream, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.clone(),
            source,
        };
        let too_large = || FetchError::TooLarge {
            url: url.clone(),
            limit: self.max_bytes,
        };

        let mut response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "image/*")
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(str::to_owned);
        if !status.is_success() {
            return Ok(Upstream {
                status,
                etag,
                bytes: Bytes::new(),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(too_large());
        }
        let mut bytes = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(Upstream {
            status,
            etag,
            bytes: bytes.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use http::header::LOCATION;
    use http::{Request, Response};
    use http_body_util::combinators::BoxBody;
    use http_body_util::{BodyExt, Full, StreamBody};
    use hyper::body::{Frame, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use crate::transform::tests::png;
    use crate::{ImageProxy, ProxyConfig};

    const LIMIT: usize = 1024;

    fn reply(request: &Request<Incoming>) -> Response<BoxBody<Bytes, Infallible>> {
        let body = match request.uri().path() {
            "/moved" => {
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, "/small")
                    .body(Full::new(Bytes::new()).boxed())
                    .unwrap();
            }
            "/declared" => Full::new(Bytes::from(vec![0; LIMIT + 1])).boxed(),
            "/streamed" => {
                let chunk = || Ok::<_, Infallible>(Frame::data(Bytes::from(vec![0; LIMIT / 2])));
                let chunks = (0..4).map(move |_| chunk());
                StreamBody::new(futures::stream::iter(chunks)).boxed()
            }
            _ => Full::new(Bytes::from(png(4, 4))).boxed(),
        };
        Response::new(body)
    }

    /// A local upstream counting the requests it receives.
    async fn serve() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let response = reply(&request);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, requests)
    }

    fn url(addr: SocketAddr, path: &str) -> Url {
        Url::parse(&format!("http://{addr}{path}")).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn fetches_small_images() {
        let (addr, _) = serve().await;
        let fetcher = ReqwestFetcher::new(LIMIT).unwrap();
        let upstream = fetcher.fetch(&url(addr, "/small")).await.unwrap();
        assert_eq!(upstream.status, StatusCode::OK);
        assert_eq!(upstream.bytes, png(4, 4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn redirects_are_not_followed() {
        let (addr, requests) = serve().await;
        let fetcher = ReqwestFetcher::new(LIMIT).unwrap();
        let upstream = fetcher.fetch(&url(addr, "/moved")).await.unwrap();
        assert_eq!(upstream.status, StatusCode::FOUND);
        assert!(upstream.bytes.is_empty());
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn proxied_redirects_fail() {
        let (addr, requests) = serve().await;
        let config = ProxyConfig {
            allowed_origins: vec![format!("http://{addr}")],
            ..Default::default()
        };
        let fetcher = Arc::new(ReqwestFetcher::new(LIMIT).unwrap());
        let proxy = ImageProxy::with_fetcher(config, fetcher).unwrap();
        let request = Request::get(format!("/api/image?url=http%3A%2F%2F{addr}%2Fmoved"))
            .header(http::header::ACCEPT, "image/png")
            .body(())
            .unwrap();

        let response = proxy.respond(&request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn declared_lengths_over_the_limit_are_refused() {
        let (addr, _) = serve().await;
        let fetcher = ReqwestFetcher::new(LIMIT).unwrap();
        let err = fetcher.fetch(&url(addr, "/declared")).await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: LIMIT, .. }), "{err:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn streamed_bodies_over_the_limit_are_refused() {
        let (addr, _) = serve().await;
        let fetcher = ReqwestFetcher::new(LIMIT).unwrap();
        let err = fetcher.fetch(&url(addr, "/streamed")).await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: LIMIT, .. }), "{err:?}");
    }
}
