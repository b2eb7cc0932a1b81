use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::{HeaderParse, TAG_PARAM};
use crate::message::{Params, SipAddr};
use crate::parser::Parser;

/// The `From` SIP header.
///
/// Indicates the initiator of the request.
#[derive(Debug, PartialEq, Clone)]
pub struct From {
    addr: SipAddr,
    tag: Option<Arc<str>>,
    params: Params,
}

impl From {
    pub fn new(addr: SipAddr) -> Self {
        Self {
            addr,
            tag: None,
            params: Params::new(),
        }
    }

    pub fn addr(&self) -> &SipAddr {
        &self.addr
    }

    pub fn uri(&self) -> &crate::message::Uri {
        self.addr.uri()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: impl Into<Arc<str>>) {
        self.tag = Some(tag.into());
    }
}

impl fmt::Display for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", From::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for From {
    const NAME: &'static str = "From";
    const SHORT_NAME: Option<&'static str> = Some("f");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let addr = parser.parse_sip_addr()?;
        let mut params = parser.parse_header_params()?;
        let tag = params.remove(TAG_PARAM).and_then(|p| p.value);

        Ok(From { addr, tag, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let from = From::from_bytes(b"Alice <sip:alice@atlanta.com>;tag=1928301774\r\n").unwrap();
        assert_eq!(from.tag(), Some("1928301774"));
        assert_eq!(from.uri().to_string(), "sip:alice@atlanta.com");
        assert_eq!(from.addr().display(), Some("Alice"));
    }

    #[test]
    fn test_parse_plain_uri() {
        let from = From::from_bytes(b"sip:bob@biloxi.com;tag=a6c85cf\r\n").unwrap();
        assert_eq!(from.tag(), Some("a6c85cf"));
        assert!(!from.addr().is_name_addr());
    }
}
