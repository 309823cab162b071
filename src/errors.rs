// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Error taxonomy for the runtime.
//!
//! The split mirrors the fatal/recoverable distinction: `DeviceError` and
//! `BackendError` are recoverable and get folded into an `Outcome` for
//! delivery through `Task::Catch`. `FatalError` represents a protocol or
//! invariant violation and is routed through `Bridge::throw_fatal_exception`,
//! which ends the process.

use thiserror::Error;

/// Errors a `Device` impl can hand back from `connect`/`execute`.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connection refused or reset")]
    ConnectionFailed(#[source] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("backend returned an error: {0}")]
    Backend(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("device was disconnected mid-request")]
    Disconnected,
}

/// Recoverable backend error carried inside an `Outcome`'s data objects.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub code: Option<i32>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError { message: message.into(), code: None }
    }

    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        BackendError { message: message.into(), code: Some(code) }
    }
}

impl From<&DeviceError> for BackendError {
    fn from(e: &DeviceError) -> Self {
        BackendError::new(e.to_string())
    }
}

/// Errors raised while building a device or pool (config-time, not request-time).
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("i/o error while creating device: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the pool bookkeeping layer (`OneShotHandler`/`KeepAliveHandler`).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no device factory registered for target {0:?}")]
    NoFactory(crate::request::Target),
    #[error("device pool for target {0:?} is at capacity")]
    AtCapacity(crate::request::Target),
    #[error("request has no target set")]
    NoTarget,
}

/// Errors raised by `Scheduler` register/push/release operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no object registered under invoke id {0}")]
    UnknownInvokeId(u64),
    #[error("object already registered under invoke id {0}")]
    DuplicateInvokeId(u64),
    #[error("scheduler is shutting down, no further requests are accepted")]
    ShuttingDown,
}

/// Errors raised by the beanstalkd work-queue consumer (`queue`).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("i/o error talking to beanstalkd")]
    Io(#[from] std::io::Error),
    #[error("unexpected beanstalkd reply: {0}")]
    Protocol(String),
    #[error("job body was not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A fatal, process-ending condition: a violated invariant or a malformed
/// inbox message. The Rust analogue of the original's thrown `ev::Exception`
/// propagating through the bridge and aborting the process.
#[derive(Debug, Error)]
#[error("fatal: {reason}")]
pub struct FatalError {
    pub reason: String,
}

impl FatalError {
    pub fn new(reason: impl Into<String>) -> Self {
        FatalError { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_converts_to_backend_error_by_message() {
        let err = DeviceError::Backend("oops".into());
        let backend: BackendError = (&err).into();
        assert_eq!(backend.message, "backend returned an error: oops");
        assert!(backend.code.is_none());
    }

    #[test]
    fn backend_error_with_code_round_trips() {
        let err = BackendError::with_code("bad request", 400);
        assert_eq!(err.code, Some(400));
        assert_eq!(err.to_string(), "bad request");
    }

    #[test]
    fn fatal_error_message_includes_reason() {
        let err = FatalError::new("inbox message too short");
        assert_eq!(err.to_string(), "fatal: inbox message too short");
    }
}
