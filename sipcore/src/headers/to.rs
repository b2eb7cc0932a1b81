use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::{HeaderParse, TAG_PARAM};
use crate::message::{Params, SipAddr};
use crate::parser::Parser;

/// The `To` SIP header.
///
/// Specifies the logical recipient of the request. The tag is added by
/// the UAS in its responses and identifies the dialog peer.
#[derive(Debug, PartialEq, Clone)]
pub struct To {
    addr: SipAddr,
    tag: Option<Arc<str>>,
    params: Params,
}

impl To {
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

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", To::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for To {
    const NAME: &'static str = "To";
    const SHORT_NAME: Option<&'static str> = Some("t");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let addr = parser.parse_sip_addr()?;
        let mut params = parser.parse_header_params()?;
        let tag = params.remove(TAG_PARAM).and_then(|p| p.value);

        Ok(To { addr, tag, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let to = To::from_bytes(b"Bob <sip:bob@biloxi.com>;tag=456248\r\n").unwrap();
        assert_eq!(to.tag(), Some("456248"));
        assert_eq!(to.uri().to_string(), "sip:bob@biloxi.com");
    }

    #[test]
    fn test_set_tag_display() {
        let mut to = To::from_bytes(b"<sip:bob@biloxi.com>\r\n").unwrap();
        assert_eq!(to.tag(), None);
        to.set_tag("9as888nz");
        assert_eq!(to.to_string(), "To: <sip:bob@biloxi.com>;tag=9as888nz");
    }
}
