//! # sipcore
//!
//! A SIP (RFC 3261) message-processing core: on-the-wire parser,
//! per-Call-ID call processes, the four transaction state machines,
//! a stateful/stateless proxy engine with forking, and a registrar
//! with GRUU support (RFC 5627).

pub mod auth;
pub mod call;
pub mod dialog;
pub mod endpoint;
pub mod headers;
pub mod message;
pub mod parser;
pub mod plugin;
pub mod proxy;
pub mod registrar;
pub mod router;
pub mod transaction;
pub mod transport;

pub(crate) mod error;
pub(crate) mod macros;

pub use endpoint::Endpoint;
pub use error::{Error, Result, SipParseError};
pub use router::Application;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::fmt;

use crate::message::Params;
use crate::parser::Parser;

/// A quality value (q-value) used in SIP headers.
///
/// # Example
///
/// ```
/// use sipcore::Q;
///
/// let q_value = "0.5".parse();
/// assert_eq!(q_value, Ok(Q(0, 5)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub struct Q(pub u8, pub u8);

impl Q {
    pub fn new(a: u8, b: u8) -> Self {
        Self(a, b)
    }
}

impl From<u8> for Q {
    fn from(value: u8) -> Self {
        Self(value, 0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseQError;

impl From<ParseQError> for Error {
    fn from(value: ParseQError) -> Self {
        Self::Parse(SipParseError {
            message: format!("{value:?}"),
        })
    }
}

impl FromStr for Q {
    type Err = ParseQError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((a, b)) => {
                let a = a.parse().map_err(|_| ParseQError)?;
                let b = b.parse().map_err(|_| ParseQError)?;
                Ok(Q(a, b))
            }
            None => match s.parse() {
                Ok(n) => Ok(Q(n, 0)),
                Err(_) => Err(ParseQError),
            },
        }
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ";q={}.{}", self.0, self.1)
    }
}

/// A MIME type naming a content format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    pub mtype: Arc<str>,
    pub subtype: Arc<str>,
}

/// The `media-type` of `Content-Type` SIP headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub mimetype: MimeType,
    pub param: Option<Params>,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let MediaType { mimetype, param } = self;
        write!(f, "{}/{}", mimetype.mtype, mimetype.subtype)?;
        if let Some(param) = &param {
            write!(f, ";{param}")?;
        }
        Ok(())
    }
}

impl MediaType {
    /// Constructs a `MediaType` from a type and a subtype.
    pub fn new(mtype: &str, subtype: &str) -> Self {
        Self {
            mimetype: MimeType {
                mtype: mtype.into(),
                subtype: subtype.into(),
            },
            param: None,
        }
    }

    pub fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let mtype = parser.parse_token()?;
        parser.must_read(b'/')?;
        let subtype = parser.parse_token()?;
        let params = parser.parse_header_params()?;
        let param = if params.is_empty() { None } else { Some(params) };

        Ok(Self {
            mimetype: MimeType {
                mtype: mtype.into(),
                subtype: subtype.into(),
            },
            param,
        })
    }
}

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());
    format!("{}:{}", ip, addr.port())
}
