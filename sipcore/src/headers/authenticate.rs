use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

/// The `WWW-Authenticate` SIP header.
///
/// The challenge text is kept verbatim; computing and checking digests
/// belongs to the authenticator collaborator. When a fork aggregates
/// 401 responses, these headers are concatenated (RFC 3261 §16.7).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WwwAuthenticate(pub Arc<str>);

/// The `Proxy-Authenticate` SIP header, kept verbatim like
/// [`WwwAuthenticate`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyAuthenticate(pub Arc<str>);

/// The `Authorization` SIP header, kept verbatim for the authenticator.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Authorization(pub Arc<str>);

/// The `Proxy-Authorization` SIP header, kept verbatim.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyAuthorization(pub Arc<str>);

macro_rules! raw_value_header {
    ($ty:ident, $name:literal) => {
        impl $ty {
            pub fn new(value: impl Into<Arc<str>>) -> Self {
                $ty(value.into())
            }

            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}: {}", $name, self.0)
            }
        }

        impl HeaderParse for $ty {
            const NAME: &'static str = $name;

            fn parse(parser: &mut Parser<'_>) -> Result<Self> {
                Ok($ty(parser.read_line_str().into()))
            }
        }
    };
}

raw_value_header!(WwwAuthenticate, "WWW-Authenticate");
raw_value_header!(ProxyAuthenticate, "Proxy-Authenticate");
raw_value_header!(Authorization, "Authorization");
raw_value_header!(ProxyAuthorization, "Proxy-Authorization");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kept_verbatim() {
        let src = b"Digest realm=\"atlanta.com\", nonce=\"84a4cc6f\", qop=\"auth\"\r\n";
        let challenge = WwwAuthenticate::from_bytes(src).unwrap();
        assert_eq!(
            challenge.value(),
            "Digest realm=\"atlanta.com\", nonce=\"84a4cc6f\", qop=\"auth\""
        );
    }
}
