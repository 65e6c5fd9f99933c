// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Awaiting the outcome of a remote [`task`](crate::task())

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::abort::AbortSignal;
use crate::consume::{consume, ConsumeOptions, RequestSettings};
use crate::error::ConsumeError;
use crate::task::{TaskError, TaskEvent};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The task reported a `failure`.
    #[error(transparent)]
    Task(TaskError),
    /// The task reported an `internalError`.
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Connection(ConsumeError),
    /// No [`tokio`] runtime was available to run the request on.
    #[error("no runtime available to execute the task")]
    Unavailable,
}

/// Request settings for [`execute`]. Requests default to `POST` with no body.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    request: RequestSettings,
}

impl ExecuteOptions {
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

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.request.abort = Some(signal);
        self
    }
}

/// Delivers the first outcome only.
struct Settle<T>(Arc<Mutex<Option<oneshot::Sender<Result<T, ExecuteError>>>>>);

impl<T> Clone for Settle<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Settle<T> {
    fn send(&self, outcome: Result<T, ExecuteError>) {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

struct CancelOnDrop(AbortSignal);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the task served at `url` and resolves to its value.
///
/// `failure` events resolve to [`ExecuteError::Task`]. A body that ends without any
/// outcome is a [`ConsumeError::Incomplete`] connection error. Dropping the returned
/// future cancels the request.
pub async fn execute<T>(url: impl Into<String>, options: ExecuteOptions) -> Result<T, ExecuteError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let settle = Settle(Arc::new(Mutex::new(Some(sender))));
    let (on_data, on_close, on_error) = (settle.clone(), settle.clone(), settle);

    let mut consume_options = ConsumeOptions::<TaskEvent<T>>::new()
        .on_data(move |event| match event {
            TaskEvent::Executing => {}
            TaskEvent::Success(value) => on_data.send(Ok(value)),
            TaskEvent::Failure(message) => {
                on_data.send(Err(ExecuteError::Task(TaskError::new(message))))
            }
            TaskEvent::InternalError(message) => on_data.send(Err(ExecuteError::Internal(message))),
        })
        .on_close(move || on_close.send(Err(ExecuteError::Connection(ConsumeError::Incomplete))))
        .on_error(move |err| on_error.send(Err(ExecuteError::Connection(err))));
    consume_options.request = options.request;

    let cancel = consume(url, consume_options).ok_or(ExecuteError::Unavailable)?;
    let _guard = CancelOnDrop(cancel.signal());
    receiver
        .await
        .unwrap_or(Err(ExecuteError::Connection(ConsumeError::Aborted)))
}
