use std::fmt::Display;
use std::io;

use serde::{Deserialize, Serialize};

/// avstore errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested object (or metadata entry) does not exist. This is a
    /// control signal, not a fault: callers branch on it.
    NotFound,
    /// End of the AVS file was reached while scanning records. Only surfaced
    /// by the compaction read path, where it terminates the scan.
    Eof,
    /// A file handle was closed underneath us. Transient: the worker retries
    /// the open once against the stable path and returns this to the caller.
    HandleClosed,
    /// Not enough free disk space to run a compaction safely.
    SystemLimit,
    /// The request did not receive a reply within the dispatcher deadline.
    Timeout,
    /// The worker has stopped and its mailbox is gone.
    Stopped,
    /// Invalid data, typically decoding errors, corruption, or a record that
    /// does not match its metadata entry.
    InvalidData(String),
    /// Another worker holds the container lock.
    Locked(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Eof => write!(f, "end of file"),
            Error::HandleClosed => write!(f, "file handle closed"),
            Error::SystemLimit => write!(f, "insufficient disk space"),
            Error::Timeout => write!(f, "request timed out"),
            Error::Stopped => write!(f, "worker stopped"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Locked(msg) => write!(f, "container locked: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An avstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // EBADF means a handle was closed underneath us; that maps to the
        // reopen sentinel rather than a plain IO failure.
        if err.raw_os_error() == Some(9) {
            return Error::HandleClosed;
        }
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}
