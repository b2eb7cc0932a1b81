use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;
use crate::MediaType;

/// The `Content-Type` SIP header.
#[derive(Debug, PartialEq, Clone)]
pub struct ContentType(pub MediaType);

impl ContentType {
    pub fn new(media_type: MediaType) -> Self {
        ContentType(media_type)
    }

    pub fn media_type(&self) -> &MediaType {
        &self.0
    }

    /// `true` for `application/sdp`, whose bodies are handed to the
    /// external SDP collaborator.
    pub fn is_sdp(&self) -> bool {
        self.0.mimetype.mtype.eq_ignore_ascii_case("application")
            && self.0.mimetype.subtype.eq_ignore_ascii_case("sdp")
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentType::NAME, self.0)
    }
}

impl HeaderParse for ContentType {
    const NAME: &'static str = "Content-Type";
    const SHORT_NAME: Option<&'static str> = Some("c");

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(ContentType(MediaType::parse(parser)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sdp() {
        let ct = ContentType::from_bytes(b"application/sdp\r\n").unwrap();
        assert!(ct.is_sdp());
        assert_eq!(ct.to_string(), "Content-Type: application/sdp");
    }

    #[test]
    fn test_parse_other() {
        let ct = ContentType::from_bytes(b"text/plain;charset=utf-8\r\n").unwrap();
        assert!(!ct.is_sdp());
    }
}
