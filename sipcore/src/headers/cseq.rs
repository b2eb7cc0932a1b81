use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::SipMethod;
use crate::parser::Parser;

/// The `CSeq` SIP header.
///
/// Orders requests within a call: a sequence number below 2³² and the
/// method of the request it numbers.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CSeq {
    pub cseq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(cseq: u32, method: SipMethod) -> Self {
        CSeq { cseq, method }
    }

    pub fn method(&self) -> &SipMethod {
        &self.method
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", CSeq::NAME, self.cseq, self.method)
    }
}

impl HeaderParse for CSeq {
    const NAME: &'static str = "CSeq";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let cseq = parser.parse_u32()?;
        parser.ws();
        let method: SipMethod = parser.parse_token()?.into();

        Ok(CSeq { cseq, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cseq = CSeq::from_bytes(b"4711 INVITE\r\n").unwrap();
        assert_eq!(cseq.cseq, 4711);
        assert_eq!(cseq.method, SipMethod::Invite);
    }

    #[test]
    fn test_number_overflow_rejected() {
        assert!(CSeq::from_bytes(b"4294967296 INVITE\r\n").is_err());
    }

    #[test]
    fn test_display() {
        let cseq = CSeq::new(1826, SipMethod::Register);
        assert_eq!(cseq.to_string(), "CSeq: 1826 REGISTER");
    }
}
