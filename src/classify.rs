//! Failure classification
//!
//! Only failures classified as transient are retried. The embedding application
//! teaches the layer how to read its own error type, either by implementing
//! [`Classify`] or by handing a classifier closure to
//! [`ResilientInvoker::protect_with`](crate::ResilientInvoker::protect_with).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse category of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote asked us to slow down
    RateLimit,
    /// The call did not complete in time
    Timeout,
    /// The remote failed while handling the call
    ServerError,
    /// The remote could not be reached
    Connection,
    /// The call is wrong and will fail again (bad input, auth, not found)
    Permanent,
}

impl FailureKind {
    /// Every kind that may be retried
    pub const TRANSIENT: [FailureKind; 4] = [
        FailureKind::RateLimit,
        FailureKind::Timeout,
        FailureKind::ServerError,
        FailureKind::Connection,
    ];

    /// Map an HTTP-style status code onto a failure kind
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => FailureKind::Timeout,
            429 => FailureKind::RateLimit,
            500..=599 => FailureKind::ServerError,
            _ => FailureKind::Permanent,
        }
    }

    /// Whether this kind can ever be retried
    pub fn is_transient(self) -> bool {
        self != FailureKind::Permanent
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Timeout => "timeout",
            FailureKind::ServerError => "server_error",
            FailureKind::Connection => "connection",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by operation error types so the invoker can decide whether to retry
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

impl<T: Classify + ?Sized> Classify for &T {
    fn failure_kind(&self) -> FailureKind {
        (**self).failure_kind()
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn failure_kind(&self) -> FailureKind {
        (**self).failure_kind()
    }
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => FailureKind::Connection,
            _ => FailureKind::Permanent,
        }
    }
}
