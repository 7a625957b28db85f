//! Error types shared by every layer.
//!
//! [`Error`] is what local callers see. [`ErrorInfo`] is the JSON-safe
//! projection of a failure that travels over a port when a remote handler
//! fails.

use std::{backtrace::Backtrace, backtrace::BacktraceStatus, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for nanosync operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The port (or the channel under it) is gone.
    #[error("port disconnected")]
    Disconnected,

    /// No reply arrived before the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer's handler failed.
    #[error("remote error: {0}")]
    Remote(ErrorInfo),

    /// A payload did not decode into the expected message type.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("service {0:?} is already registered")]
    DuplicateService(String),

    /// The persistent store behind a KVS service failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Transport faults are local and worth retrying; everything else is not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Timeout(_))
    }

    /// Stable name used when this error crosses a port.
    pub fn name(&self) -> &str {
        match self {
            Error::Disconnected => "Disconnected",
            Error::Timeout(_) => "Timeout",
            Error::Remote(info) => &info.name,
            Error::Malformed(_) => "MalformedMessage",
            Error::Serialization(_) => "SerializationError",
            Error::DuplicateService(_) => "DuplicateService",
            Error::Storage(_) => "StorageError",
        }
    }
}

/// Wire form of a failed request: `{name, message?, stack?, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: Some(message.into()),
            stack: None,
            data: None,
        }
    }

    /// Reply sent when the receiving side has no request handler.
    pub fn not_implemented() -> Self {
        Self::new("NotImplemented", "no request handler is installed")
    }

    /// Projects a Rust error: the type name becomes `name`, its `Display`
    /// output the `message`. A backtrace is attached only when capture is
    /// enabled (`RUST_BACKTRACE`).
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let type_name = std::any::type_name::<E>();
        let name = type_name.rsplit("::").next().unwrap_or(type_name);
        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
        Self {
            name: name.to_string(),
            message: Some(err.to_string()),
            stack,
            data: None,
        }
    }

    /// Fallback for failures that are plain values rather than errors.
    pub fn from_thrown<T: Serialize + ?Sized>(thrown: &T) -> Self {
        Self {
            name: String::new(),
            message: None,
            stack: None,
            data: None,
        }
        .with_data(thrown)
    }

    /// Attaches structured data. Anything that fails to serialize becomes `{}`.
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|_| Value::Object(Default::default()));
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.name, message),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<Error> for ErrorInfo {
    fn from(err: Error) -> Self {
        match err {
            Error::Remote(info) => info,
            other => ErrorInfo::new(other.name(), other.to_string()),
        }
    }
}
