use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::{HeaderParse, EXPIRES_PARAM, Q_PARAM};
use crate::message::{Params, SipAddr, Uri};
use crate::parser::Parser;
use crate::Q;

const INSTANCE_PARAM: &str = "+sip.instance";
const REG_ID_PARAM: &str = "reg-id";
const PUB_GRUU_PARAM: &str = "pub-gruu";
const TEMP_GRUU_PARAM: &str = "temp-gruu";

/// A bound contact address with its header parameters.
#[derive(Debug, PartialEq, Clone)]
pub struct ContactAddr {
    addr: SipAddr,
    q: Option<Q>,
    expires: Option<u32>,
    params: Params,
}

impl ContactAddr {
    pub fn new(addr: SipAddr) -> Self {
        ContactAddr {
            addr,
            q: None,
            expires: None,
            params: Params::new(),
        }
    }

    pub fn addr(&self) -> &SipAddr {
        &self.addr
    }

    pub fn uri(&self) -> &Uri {
        self.addr.uri()
    }

    pub fn q(&self) -> Option<Q> {
        self.q
    }

    /// The `expires` parameter, when present.
    pub fn expires(&self) -> Option<u32> {
        self.expires
    }

    pub fn set_expires(&mut self, secs: u32) {
        self.expires = Some(secs);
    }

    /// The `+sip.instance` parameter value, quotes kept as received.
    pub fn instance(&self) -> Option<&str> {
        self.params.get(INSTANCE_PARAM)
    }

    /// The `reg-id` parameter (RFC 5626).
    pub fn reg_id(&self) -> Option<u32> {
        self.params.get(REG_ID_PARAM).and_then(|v| v.parse().ok())
    }

    pub fn set_param(&mut self, name: impl Into<Arc<str>>, value: Option<impl Into<Arc<str>>>) {
        self.params.set(name, value);
    }

    /// Attaches the `pub-gruu` parameter echoed by the registrar.
    pub fn set_pub_gruu(&mut self, gruu: &Uri) {
        self.params.set(PUB_GRUU_PARAM, Some(format!("\"{gruu}\"")));
    }

    /// Attaches the `temp-gruu` parameter echoed by the registrar.
    pub fn set_temp_gruu(&mut self, gruu: &Uri) {
        self.params.set(TEMP_GRUU_PARAM, Some(format!("\"{gruu}\"")));
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl fmt::Display for ContactAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)?;
        if let Some(q) = &self.q {
            write!(f, "{q}")?;
        }
        if let Some(expires) = &self.expires {
            write!(f, ";expires={expires}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

/// The `Contact` SIP header.
///
/// Carries a reachable URI for the sender, or `*` in a REGISTER that
/// removes every binding (RFC 3261 §10.2.2).
#[derive(Debug, PartialEq, Clone)]
pub enum Contact {
    /// The wildcard `*` form.
    Star,
    /// A concrete contact address.
    Addr(ContactAddr),
}

impl Contact {
    pub fn is_star(&self) -> bool {
        matches!(self, Contact::Star)
    }

    pub fn addr(&self) -> Option<&ContactAddr> {
        match self {
            Contact::Star => None,
            Contact::Addr(addr) => Some(addr),
        }
    }
}

impl From<ContactAddr> for Contact {
    fn from(addr: ContactAddr) -> Self {
        Contact::Addr(addr)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contact::Star => write!(f, "{}: *", Contact::NAME),
            Contact::Addr(addr) => write!(f, "{}: {addr}", Contact::NAME),
        }
    }
}

impl HeaderParse for Contact {
    const NAME: &'static str = "Contact";
    const SHORT_NAME: Option<&'static str> = Some("m");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        if parser.eat(b"*") {
            return Ok(Contact::Star);
        }

        let addr = parser.parse_sip_addr()?;
        let mut params = parser.parse_header_params()?;

        let q = params
            .remove(Q_PARAM)
            .and_then(|p| p.value)
            .and_then(|v| v.parse().ok());
        let expires = params
            .remove(EXPIRES_PARAM)
            .and_then(|p| p.value)
            .and_then(|v| v.parse().ok());

        Ok(Contact::Addr(ContactAddr {
            addr,
            q,
            expires,
            params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_star() {
        let contact = Contact::from_bytes(b"*\r\n").unwrap();
        assert!(contact.is_star());
    }

    #[test]
    fn test_parse_with_q_and_expires() {
        let contact = Contact::from_bytes(b"<sip:bob@192.0.2.4>;q=0.7;expires=3600\r\n").unwrap();
        let addr = contact.addr().unwrap();
        assert_eq!(addr.q(), Some(Q(0, 7)));
        assert_eq!(addr.expires(), Some(3600));
    }

    #[test]
    fn test_instance_and_reg_id() {
        let contact = Contact::from_bytes(
            b"<sip:client1@127.0.0.1:5070>;+sip.instance=\"<urn:uuid:u1>\";reg-id=1\r\n",
        )
        .unwrap();
        let addr = contact.addr().unwrap();
        assert_eq!(addr.instance(), Some("\"<urn:uuid:u1>\""));
        assert_eq!(addr.reg_id(), Some(1));
    }
}
