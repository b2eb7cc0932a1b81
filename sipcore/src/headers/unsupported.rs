use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Unsupported` SIP header: option tags rejected in a 420.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Unsupported(Vec<Arc<str>>);

impl Unsupported {
    pub fn new(tags: Vec<Arc<str>>) -> Self {
        Unsupported(tags)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| &**t)
    }
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", Unsupported::NAME)?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl HeaderParse for Unsupported {
    const NAME: &'static str = "Unsupported";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(Unsupported(parser.parse_token_list()?))
    }
}
