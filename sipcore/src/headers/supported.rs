use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Supported` SIP header: option tags the sender understands.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Supported(Vec<Arc<str>>);

impl Supported {
    pub fn new(tags: Vec<Arc<str>>) -> Self {
        Supported(tags)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| &**t)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for Supported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", Supported::NAME)?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl HeaderParse for Supported {
    const NAME: &'static str = "Supported";
    const SHORT_NAME: Option<&'static str> = Some("k");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(Supported(parser.parse_token_list()?))
    }
}
