use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Content-Length` SIP header.
///
/// The body size in bytes. Mandatory on stream transports, where it
/// delimits messages.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ContentLength(u32);

impl ContentLength {
    pub fn new(len: u32) -> Self {
        ContentLength(len)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ContentLength {
    fn from(len: u32) -> Self {
        ContentLength(len)
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentLength::NAME, self.0)
    }
}

impl HeaderParse for ContentLength {
    const NAME: &'static str = "Content-Length";
    const SHORT_NAME: Option<&'static str> = Some("l");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        // A leading '-' never parses as u32, so negative lengths are
        // rejected here.
        Ok(ContentLength(parser.parse_u32()?))
    }
}
