use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Require` SIP header: option tags the receiver must support.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Require(Vec<Arc<str>>);

impl Require {
    pub fn new(tags: Vec<Arc<str>>) -> Self {
        Require(tags)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| &**t)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for Require {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", Require::NAME)?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl HeaderParse for Require {
    const NAME: &'static str = "Require";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(Require(parser.parse_token_list()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let require = Require::from_bytes(b"100rel, gruu\r\n").unwrap();
        assert!(require.contains("gruu"));
        assert!(require.contains("100rel"));
        assert!(!require.contains("outbound"));
    }
}
