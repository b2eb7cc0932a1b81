use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::{NameAddr, Params, SipAddr, Uri};
use crate::parser::Parser;

/// The `Record-Route` SIP header.
///
/// Inserted by proxies that want to stay on the path of in-dialog
/// requests; dialogs turn the recorded list into their route set.
#[derive(Debug, PartialEq, Clone)]
pub struct RecordRoute {
    pub name_addr: NameAddr,
    pub params: Params,
}

impl RecordRoute {
    pub fn new(uri: Uri) -> Self {
        RecordRoute {
            name_addr: NameAddr::new(uri),
            params: Params::new(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.name_addr.uri
    }
}

impl fmt::Display for RecordRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", RecordRoute::NAME, self.name_addr)?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for RecordRoute {
    const NAME: &'static str = "Record-Route";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let name_addr = match parser.parse_sip_addr()? {
            SipAddr::NameAddr(name_addr) => name_addr,
            SipAddr::Uri(uri) => NameAddr::new(uri),
        };
        let params = parser.parse_header_params()?;

        Ok(RecordRoute { name_addr, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let rr = RecordRoute::from_bytes(b"<sip:p2.domain.com;lr>\r\n").unwrap();
        assert!(rr.uri().lr_param);
        assert_eq!(rr.to_string(), "Record-Route: <sip:p2.domain.com;lr>");
    }
}
