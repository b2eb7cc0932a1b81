use std::fmt;
use std::str::Utf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error produced while parsing SIP syntax.
#[derive(Debug, PartialEq, Eq, Error)]
pub struct SipParseError {
    /// Human-readable reason.
    pub message: String,
}

impl fmt::Display for SipParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl SipParseError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl From<&str> for SipParseError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SipParseError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Utf8Error> for SipParseError {
    fn from(value: Utf8Error) -> Self {
        SipParseError {
            message: format!("{value}"),
        }
    }
}

impl From<sipcore_util::Error> for SipParseError {
    fn from(err: sipcore_util::Error) -> Self {
        SipParseError {
            message: format!(
                "failed to parse at line:{} column:{} kind:{:?}",
                err.line, err.col, err.kind,
            ),
        }
    }
}

impl From<sipcore_util::Error> for Error {
    fn from(err: sipcore_util::Error) -> Self {
        Error::Parse(err.into())
    }
}

impl From<std::fmt::Error> for Error {
    fn from(value: std::fmt::Error) -> Self {
        Self::Fmt(value)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] SipParseError),

    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No transport available for {0}")]
    TransportNotFound(String),

    #[error("Transaction already exists for this key")]
    TransactionExists,

    #[error("Dialog not found")]
    DialogNotFound,

    #[error("Fmt error")]
    Fmt(std::fmt::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
