use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::{NameAddr, Params, SipAddr, Uri};
use crate::parser::Parser;

/// The `Route` SIP header.
///
/// Forces a request through the listed proxies (RFC 3261 §16.12).
#[derive(Debug, PartialEq, Clone)]
pub struct Route {
    pub name_addr: NameAddr,
    pub params: Params,
}

impl Route {
    pub fn new(uri: Uri) -> Self {
        Route {
            name_addr: NameAddr::new(uri),
            params: Params::new(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.name_addr.uri
    }

    /// `true` when the route URI carries the `lr` loose-routing flag.
    pub fn is_loose(&self) -> bool {
        self.name_addr.uri.lr_param
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Route::NAME, self.name_addr)?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for Route {
    const NAME: &'static str = "Route";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let name_addr = match parser.parse_sip_addr()? {
            SipAddr::NameAddr(name_addr) => name_addr,
            SipAddr::Uri(uri) => NameAddr::new(uri),
        };
        let params = parser.parse_header_params()?;

        Ok(Route { name_addr, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loose_route() {
        let route = Route::from_bytes(b"<sip:proxy.example.com;lr>\r\n").unwrap();
        assert!(route.is_loose());
    }

    #[test]
    fn test_parse_strict_route() {
        let route = Route::from_bytes(b"<sip:p1.example.com>\r\n").unwrap();
        assert!(!route.is_loose());
    }
}
