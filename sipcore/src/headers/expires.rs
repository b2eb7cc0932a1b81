use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Expires` SIP header.
///
/// Gives the relative lifetime, in seconds, of the message contents
/// (registration bindings, subscriptions).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Expires(u32);

impl Expires {
    pub fn new(secs: u32) -> Self {
        Expires(secs)
    }

    pub fn secs(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Expires::NAME, self.0)
    }
}

impl HeaderParse for Expires {
    const NAME: &'static str = "Expires";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(Expires(parser.parse_u32()?))
    }
}
