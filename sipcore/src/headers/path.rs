use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::{NameAddr, Params, SipAddr, Uri};
use crate::parser::Parser;

/// The `Path` SIP header (RFC 3327).
///
/// Accumulated by edge proxies on a REGISTER so the registrar can
/// route back to the contact through them.
#[derive(Debug, PartialEq, Clone)]
pub struct Path {
    pub name_addr: NameAddr,
    pub params: Params,
}

impl Path {
    pub fn new(uri: Uri) -> Self {
        Path {
            name_addr: NameAddr::new(uri),
            params: Params::new(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.name_addr.uri
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Path::NAME, self.name_addr)?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for Path {
    const NAME: &'static str = "Path";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let name_addr = match parser.parse_sip_addr()? {
            SipAddr::NameAddr(name_addr) => name_addr,
            SipAddr::Uri(uri) => NameAddr::new(uri),
        };
        let params = parser.parse_header_params()?;

        Ok(Path { name_addr, params })
    }
}
