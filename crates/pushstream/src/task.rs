// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One action, one outcome: a stream protocol for request/response style work

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use http::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::body::EventBody;
use crate::emitter::{Emitter, Heartbeat};
use crate::error::DecodeError;
use crate::event::Events;
use crate::stream::{stream, ProducerResult, StreamOptions};

/// Message sent instead of internal error details when those are redacted.
pub const REDACTED_INTERNAL_ERROR: &str = "Internal Error";

/// A failure whose message is meant for end users.
///
/// Return it (anywhere in the [`anyhow`] chain) from a task action to report a
/// `failure` event; every other error becomes an `internalError`.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Events of a task stream.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent<T> {
    Executing,
    Success(T),
    Failure(String),
    InternalError(String),
}

impl<T> Events for TaskEvent<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        match self {
            Self::Executing => "executing",
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::InternalError(_) => "internalError",
        }
    }

    fn data(&self) -> serde_json::Result<String> {
        match self {
            Self::Executing => serde_json::to_string(""),
            Self::Success(value) => serde_json::to_string(value),
            Self::Failure(message) | Self::InternalError(message) => {
                serde_json::to_string(message)
            }
        }
    }

    fn decode(name: &str, data: &str) -> Result<Self, DecodeError> {
        let parse_message =
            || serde_json::from_str(data).map_err(|e| DecodeError::payload(name, e));
        match name {
            "executing" => Ok(Self::Executing),
            "success" => serde_json::from_str(data)
                .map(Self::Success)
                .map_err(|e| DecodeError::payload(name, e)),
            "failure" => parse_message().map(Self::Failure),
            "internalError" => parse_message().map(Self::InternalError),
            other => Err(DecodeError::UnknownEvent(other.to_owned())),
        }
    }
}

/// How a task action ended.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome<T> {
    Success(T),
    Failure(TaskError),
    InternalError(String),
}

impl<T> TaskOutcome<T> {
    /// Classifies an action's result: a [`TaskError`] in the chain is a failure.
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => match err.downcast_ref::<TaskError>() {
                Some(task_error) => Self::Failure(task_error.clone()),
                None => Self::InternalError(format!("{err:#}")),
            },
        }
    }

    fn state(&self) -> TaskState {
        match self {
            Self::Success(_) => TaskState::Success,
            Self::Failure(_) => TaskState::Failure,
            Self::InternalError(_) => TaskState::InternalError,
        }
    }

    fn into_event(self, redact_internal_errors: bool) -> TaskEvent<T> {
        match self {
            Self::Success(value) => TaskEvent::Success(value),
            Self::Failure(err) => TaskEvent::Failure(err.message),
            Self::InternalError(message) => {
                TaskEvent::InternalError(redact(message, redact_internal_errors))
            }
        }
    }
}

fn redact(message: String, redact_internal_errors: bool) -> String {
    if redact_internal_errors {
        REDACTED_INTERNAL_ERROR.to_owned()
    } else {
        message
    }
}

/// Lifecycle of a single task session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Executing,
    Success,
    Failure,
    InternalError,
    Closed,
}

impl TaskState {
    fn advance(&mut self, next: TaskState) {
        debug!("Task {:?} -> {:?}", self, next);
        *self = next;
    }
}

#[derive(Debug)]
pub struct TaskOptions {
    /// Options of the underlying stream. Heartbeats are disabled by default.
    pub stream: StreamOptions,
    /// Replace internal error messages with [`REDACTED_INTERNAL_ERROR`].
    ///
    /// Defaults to `true` in release builds.
    pub redact_internal_errors: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            stream: StreamOptions {
                heartbeat: Heartbeat::Disabled,
                ..Default::default()
            },
            redact_internal_errors: !cfg!(debug_assertions),
        }
    }
}

/// Runs `action` and streams its outcome.
///
/// The body carries `executing`, then exactly one of `success`, `failure` or
/// `internalError`, and then ends. Panics in `action` are internal errors.
pub fn task<T, F, Fut>(action: F, options: TaskOptions) -> Response<EventBody>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let redact_internal_errors = options.redact_internal_errors;
    stream(
        move |emitter: Emitter<TaskEvent<T>>| run_task(emitter, action, redact_internal_errors),
        options.stream,
    )
}

async fn run_task<T, F, Fut>(
    emitter: Emitter<TaskEvent<T>>,
    action: F,
    redact_internal_errors: bool,
) -> ProducerResult
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let mut state = TaskState::Executing;
    emitter.emit(TaskEvent::Executing)?;

    let outcome = match AssertUnwindSafe(async move { action().await })
        .catch_unwind()
        .await
    {
        Ok(result) => TaskOutcome::from_result(result),
        Err(_) => TaskOutcome::InternalError("task action panicked".to_owned()),
    };
    if let TaskOutcome::InternalError(message) = &outcome {
        error!("Task failed: {message}");
    }
    state.advance(outcome.state());

    if let Err(err) = emitter.emit(outcome.into_event(redact_internal_errors)) {
        error!("Could not emit task outcome: {err}");
        state.advance(TaskState::InternalError);
        emitter.emit(TaskEvent::InternalError(redact(
            err.to_string(),
            redact_internal_errors,
        )))?;
    }

    emitter.close().await;
    state.advance(TaskState::Closed);
    Ok(None)
}
