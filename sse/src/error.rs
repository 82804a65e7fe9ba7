//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root `Error`
//! struct holding an error kind tree and an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Top-level error type for the fan-out engine.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the fan-out engine.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// Producer-side problems detected before anything is stored or dispatched.
    Validation(ValidationErrorKind),
    /// Handing a frame to a single connection's outbound queue failed.
    Send(SendErrorKind),
    /// The broker could not accept a request.
    Broker(BrokerErrorKind),
    /// Writing to the client transport failed.
    Transport,
}

#[derive(Debug, PartialEq)]
pub enum ValidationErrorKind {
    Serialization,
    InvalidKind,
    InvalidId,
}

#[derive(Debug, PartialEq)]
pub enum SendErrorKind {
    Timeout,
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum BrokerErrorKind {
    Overloaded,
    ShutDown,
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub(crate) fn send_timeout() -> Self {
        Self::new(ErrorKind::Send(SendErrorKind::Timeout))
    }

    pub(crate) fn send_closed() -> Self {
        Self::new(ErrorKind::Send(SendErrorKind::Closed))
    }

    pub(crate) fn broker(kind: BrokerErrorKind) -> Self {
        Self::new(ErrorKind::Broker(kind))
    }

    pub(crate) fn validation(kind: ValidationErrorKind) -> Self {
        Self::new(ErrorKind::Validation(kind))
    }

    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Transport,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == ErrorKind::Send(SendErrorKind::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.error_kind == ErrorKind::Send(SendErrorKind::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Validation(kind) => write!(f, "Validation error: {kind:?}"),
            ErrorKind::Send(kind) => write!(f, "Send error: {kind:?}"),
            ErrorKind::Broker(kind) => write!(f, "Broker error: {kind:?}"),
            ErrorKind::Transport => write!(f, "Transport error"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Validation(ValidationErrorKind::Serialization),
        }
    }
}
