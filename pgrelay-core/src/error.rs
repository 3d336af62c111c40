//! Error and Result types for the pool core.
//!
//! The variant set mirrors the taxonomy in the design: configuration, protocol,
//! authentication, resource, and timeout errors each map to a distinct PostgreSQL
//! `ErrorResponse` at the edge (see [`AuthFailure::sqlstate`]).

use std::fmt;
use std::io;

use thiserror::Error;

/// A specialized `Result` type used throughout the pool core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    #[error("a resource could not be acquired: {0}")]
    Resource(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("the pool has no available slot for this request")]
    PoolFull,

    #[error("no upstream server is available")]
    NoServer,

    #[error("database refused the request: {0}")]
    Database(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// The PostgreSQL `ErrorResponse` SQLSTATE this error should surface to a
    /// connected client, if any.
    pub fn sqlstate(&self) -> Option<&'static str> {
        match self {
            Error::Auth(failure) => Some(failure.sqlstate()),
            Error::PoolFull => Some("53300"),
            _ => None,
        }
    }
}

/// The outcome of a single authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("bad password")]
    BadPassword,
    #[error("authentication error")]
    Error,
    #[error("authentication timed out")]
    Timeout,
    #[error("host-based authentication rejected this connection")]
    HbaReject,
    #[error("the target database is disabled")]
    DatabaseDisabled,
    #[error("the pool is draining")]
    Gracefully,
}

impl AuthFailure {
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            AuthFailure::BadPassword => "28P01",
            AuthFailure::HbaReject => "28000",
            AuthFailure::Gracefully => "57P03",
            AuthFailure::DatabaseDisabled => "53300",
            AuthFailure::Error | AuthFailure::Timeout => "08000",
        }
    }
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthOutcome::Success => write!(f, "success"),
            AuthOutcome::Failure(e) => write!(f, "failure: {e}"),
        }
    }
}

/// Convenience wrapper pairing a `SUCCESS | BAD_PASSWORD | ERROR | TIMEOUT`
/// outcome with the `Ok(())` case, so auth-driving code can `?`-propagate genuine
/// I/O errors while still pattern-matching on credential outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure(AuthFailure),
}

impl From<io::ErrorKind> for Error {
    fn from(kind: io::ErrorKind) -> Self {
        Error::Io(kind.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_password_maps_to_28p01() {
        assert_eq!(AuthFailure::BadPassword.sqlstate(), "28P01");
    }

    #[test]
    fn hba_reject_maps_to_28000() {
        assert_eq!(AuthFailure::HbaReject.sqlstate(), "28000");
    }

    #[test]
    fn pool_full_maps_to_53300() {
        let err = Error::PoolFull;
        assert_eq!(err.sqlstate(), Some("53300"));
    }
}
