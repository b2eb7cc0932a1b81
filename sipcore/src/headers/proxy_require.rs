use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Proxy-Require` SIP header: option tags proxies must support.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ProxyRequire(Vec<Arc<str>>);

impl ProxyRequire {
    pub fn new(tags: Vec<Arc<str>>) -> Self {
        ProxyRequire(tags)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| &**t)
    }
}

impl fmt::Display for ProxyRequire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", ProxyRequire::NAME)?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl HeaderParse for ProxyRequire {
    const NAME: &'static str = "Proxy-Require";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(ProxyRequire(parser.parse_token_list()?))
    }
}
