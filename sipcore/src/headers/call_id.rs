use core::fmt;
use std::sync::Arc;

use sipcore_util::util::{is_newline, is_space};

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `Call-ID` SIP header.
///
/// Groups all requests and responses of a call. All messages sharing a
/// Call-ID are owned by the same call process.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct CallId(Arc<str>);

impl CallId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        CallId(id.into())
    }

    /// A freshly generated Call-ID.
    pub fn generate() -> Self {
        CallId(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", CallId::NAME, self.0)
    }
}

impl HeaderParse for CallId {
    const NAME: &'static str = "Call-ID";
    const SHORT_NAME: Option<&'static str> = Some("i");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let id = parser.read_while_str(|b| !is_space(b) && !is_newline(b));
        Ok(CallId(id.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let call_id = CallId::from_bytes(b"843817637684230@998sdasdh09\r\n").unwrap();
        assert_eq!(call_id.as_str(), "843817637684230@998sdasdh09");
        assert_eq!(call_id.to_string(), "Call-ID: 843817637684230@998sdasdh09");
    }
}
