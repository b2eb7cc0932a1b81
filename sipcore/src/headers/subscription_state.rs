use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::Params;
use crate::parser::Parser;

const EXPIRES_PARAM: &str = "expires";
const REASON_PARAM: &str = "reason";

/// The `Subscription-State` SIP header (RFC 6665).
#[derive(Debug, PartialEq, Clone)]
pub struct SubscriptionState {
    state: Arc<str>,
    expires: Option<u32>,
    reason: Option<Arc<str>>,
    params: Params,
}

impl SubscriptionState {
    pub fn new(state: impl Into<Arc<str>>) -> Self {
        SubscriptionState {
            state: state.into(),
            expires: None,
            reason: None,
            params: Params::new(),
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn expires(&self) -> Option<u32> {
        self.expires
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// `true` when this NOTIFY ends the subscription usage.
    pub fn is_terminated(&self) -> bool {
        self.state.eq_ignore_ascii_case("terminated")
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", SubscriptionState::NAME, self.state)?;
        if let Some(reason) = &self.reason {
            write!(f, ";reason={reason}")?;
        }
        if let Some(expires) = &self.expires {
            write!(f, ";expires={expires}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for SubscriptionState {
    const NAME: &'static str = "Subscription-State";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let state = parser.parse_token()?;
        let mut params = parser.parse_header_params()?;
        let expires = params
            .remove(EXPIRES_PARAM)
            .and_then(|p| p.value)
            .and_then(|v| v.parse().ok());
        let reason = params.remove(REASON_PARAM).and_then(|p| p.value);

        Ok(SubscriptionState {
            state: state.into(),
            expires,
            reason,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let ss = SubscriptionState::from_bytes(b"active;expires=600\r\n").unwrap();
        assert_eq!(ss.state(), "active");
        assert_eq!(ss.expires(), Some(600));
        assert!(!ss.is_terminated());

        let ss = SubscriptionState::from_bytes(b"terminated;reason=timeout\r\n").unwrap();
        assert!(ss.is_terminated());
        assert_eq!(ss.reason(), Some("timeout"));
    }
}
