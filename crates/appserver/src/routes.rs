// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request routing and the demo endpoints

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::{Method, Request};
use serde::Deserialize;
use tokio::select;
use tokio::time::{interval_at, sleep, Instant};
use tracing::debug;

use picture::{ImageProxy, ProxyConfig};
use pushstream::{
    stream, task, DecodeError, Emitter, Events, Heartbeat, ProducerResult, StreamOptions,
    TaskError, TaskOptions,
};

use crate::config::Config;
use crate::response::{
    boxed, empty, json_error, not_found, ErrResponse, GenericResponse, ResponseResult, StatusCode,
};

pub const TASK_PATH: &str = "/api/task";
pub const STREAM_PATH: &str = "/api/stream";

/// How long the demo task pretends to work.
const TASK_DELAY: Duration = Duration::from_secs(1);
/// Period of the demo counter.
const COUNTER_PERIOD: Duration = Duration::from_secs(1);
/// Last value the demo counter emits.
const COUNTER_MAX: u32 = 5;
/// Largest accepted task request body, in bytes.
pub const TASK_BODY_LIMIT: usize = 16 * 1024;

/// Everything requests are served with.
#[derive(Debug)]
pub struct AppState {
    pub proxy: ImageProxy,
    pub stream_heartbeat: Heartbeat,
    pub task_heartbeat: Heartbeat,
    pub production: bool,
}

impl AppState {
    /// Validates `config` for a server listening on `port`.
    pub fn new(config: Config, port: u16, production: bool) -> anyhow::Result<Self> {
        let Config { image, stream } = config;
        let image = ProxyConfig {
            base_url: image
                .base_url
                .or_else(|| Some(format!("http://localhost:{port}"))),
            production: image.production || production,
            ..image
        };
        let proxy = ImageProxy::new(image).context("Invalid [image] config")?;
        let stream_heartbeat = stream
            .stream_heartbeat()
            .context("Invalid [stream] heartbeat")?;
        let task_heartbeat = stream
            .task_heartbeat()
            .context("Invalid [stream] task_heartbeat")?;
        Ok(Self {
            proxy,
            stream_heartbeat,
            task_heartbeat,
            production,
        })
    }

    fn task_options(&self) -> TaskOptions {
        let mut options = TaskOptions::default();
        options.stream.heartbeat = self.task_heartbeat;
        // Debug builds keep detailed messages unless running in production mode.
        options.redact_internal_errors |= self.production;
        options
    }
}

pub async fn respond<B>(state: Arc<AppState>, request: Request<B>) -> GenericResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match route(&state, request).await {
        Ok(response) => response,
        Err(ErrResponse(response)) => {
            debug!("Rejected request: {}", response.status());
            response
        }
    }
}

async fn route<B>(state: &AppState, request: Request<B>) -> ResponseResult
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    if request.method() == Method::OPTIONS {
        return Ok(preflight());
    }

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    if state.proxy.matches_path(&path) {
        // The proxy only looks at the request line and headers.
        let (parts, _) = request.into_parts();
        let request = Request::from_parts(parts, ());
        return Ok(boxed(state.proxy.respond(&request).await));
    }

    match (method, path.as_str()) {
        (Method::POST, TASK_PATH) => respond_to_task(state, request).await,
        (Method::POST, STREAM_PATH) => Ok(boxed(stream(
            count,
            StreamOptions {
                heartbeat: state.stream_heartbeat,
                ..Default::default()
            },
        ))),
        _ => Ok(not_found()),
    }
}

fn preflight() -> GenericResponse {
    let mut response = empty();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, POST, OPTIONS"),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    response
}

#[derive(Debug, Deserialize)]
struct TaskInput {
    #[serde(default)]
    n: serde_json::Value,
}

async fn respond_to_task<B>(state: &AppState, request: Request<B>) -> ResponseResult
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let body = request.into_body();
    let too_large = || {
        let message = format!("Request body exceeds {TASK_BODY_LIMIT} bytes");
        ErrResponse(json_error(StatusCode::PAYLOAD_TOO_LARGE, message))
    };
    if body.size_hint().lower() > TASK_BODY_LIMIT as u64 {
        return Err(too_large());
    }
    let body = Limited::new(body, TASK_BODY_LIMIT)
        .collect()
        .await
        .map_err(|err| {
            if err.is::<LengthLimitError>() {
                too_large()
            } else {
                ErrResponse(json_error(StatusCode::BAD_REQUEST, err))
            }
        })?
        .to_bytes();
    let input: TaskInput = serde_json::from_slice(&body)
        .map_err(|_| ErrResponse(json_error(StatusCode::BAD_REQUEST, "Invalid JSON body")))?;
    let n = input
        .n
        .as_f64()
        .ok_or_else(|| ErrResponse(json_error(StatusCode::BAD_REQUEST, "Input is not a number")))?;

    let action = move || async move {
        sleep(TASK_DELAY).await;
        check_prime(n)
    };
    Ok(boxed(task(action, state.task_options())))
}

/// Largest integer below which every integer is exactly representable as `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn check_prime(n: f64) -> anyhow::Result<bool> {
    if n.fract() != 0.0 {
        return Err(TaskError::new("Input is not an integer").into());
    }
    if n.abs() > MAX_SAFE_INTEGER {
        return Err(TaskError::new("Input is too large").into());
    }
    Ok(n >= 2.0 && is_prime(n as u64))
}

/// Trial division.
fn is_prime(n: u64) -> bool {
    n >= 2 && (2..).take_while(|i| i * i <= n).all(|i| n % i != 0)
}

/// Events of the demo counter stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterEvent {
    Increment(u32),
}

impl Events for CounterEvent {
    fn name(&self) -> &str {
        match self {
            Self::Increment(_) => "increment",
        }
    }

    fn data(&self) -> serde_json::Result<String> {
        match self {
            Self::Increment(count) => serde_json::to_string(count),
        }
    }

    fn decode(name: &str, data: &str) -> Result<Self, DecodeError> {
        match name {
            "increment" => serde_json::from_str(data)
                .map(Self::Increment)
                .map_err(|e| DecodeError::payload(name, e)),
            other => Err(DecodeError::UnknownEvent(other.to_owned())),
        }
    }
}

/// Emits `increment` with 0 through [`COUNTER_MAX`], one per period, then closes.
async fn count(emitter: Emitter<CounterEvent>) -> ProducerResult {
    let abort = emitter.abort_signal();
    let mut ticks = interval_at(Instant::now() + COUNTER_PERIOD, COUNTER_PERIOD);
    for count in 0..=COUNTER_MAX {
        select! {
            biased;
            _ = abort.aborted() => {
                debug!("Counter stopped at {count}.");
                return Ok(None);
            }
            _ = ticks.tick() => {}
        }
        emitter.emit(CounterEvent::Increment(count))?;
    }
    emitter.close().await;
    Ok(None)
}
