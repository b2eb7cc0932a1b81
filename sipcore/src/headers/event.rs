use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::Params;
use crate::parser::Parser;

const ID_PARAM: &str = "id";

/// The `Event` SIP header (RFC 6665).
///
/// Names the event package of a SUBSCRIBE/NOTIFY, with the optional
/// `id` distinguishing parallel subscriptions in one dialog.
#[derive(Debug, PartialEq, Clone)]
pub struct Event {
    event: Arc<str>,
    id: Option<Arc<str>>,
    params: Params,
}

impl Event {
    pub fn new(event: impl Into<Arc<str>>) -> Self {
        Event {
            event: event.into(),
            id: None,
            params: Params::new(),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The `(event, id)` pair identifying a subscription usage.
    pub fn usage_key(&self) -> (Arc<str>, Option<Arc<str>>) {
        (self.event.clone(), self.id.clone())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Event::NAME, self.event)?;
        if let Some(id) = &self.id {
            write!(f, ";id={id}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for Event {
    const NAME: &'static str = "Event";
    const SHORT_NAME: Option<&'static str> = Some("o");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let event = parser.parse_token()?;
        let mut params = parser.parse_header_params()?;
        let id = params.remove(ID_PARAM).and_then(|p| p.value);

        Ok(Event {
            event: event.into(),
            id,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let event = Event::from_bytes(b"presence;id=42\r\n").unwrap();
        assert_eq!(event.event(), "presence");
        assert_eq!(event.id(), Some("42"));
    }
}
