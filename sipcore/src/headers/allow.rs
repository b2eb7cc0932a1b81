use core::fmt;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::SipMethod;
use crate::parser::Parser;

/// The `Allow` SIP header: methods the sender accepts.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Allow(Vec<SipMethod>);

impl Allow {
    pub fn new(methods: Vec<SipMethod>) -> Self {
        Allow(methods)
    }

    pub fn methods(&self) -> impl Iterator<Item = &SipMethod> {
        self.0.iter()
    }

    pub fn contains(&self, method: &SipMethod) -> bool {
        self.0.contains(method)
    }
}

impl fmt::Display for Allow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", Allow::NAME)?;
        for (i, method) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{method}")?;
        }
        Ok(())
    }
}

impl HeaderParse for Allow {
    const NAME: &'static str = "Allow";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let methods = parser
            .parse_token_list()?
            .into_iter()
            .map(|t| SipMethod::from(&*t))
            .collect();
        Ok(Allow(methods))
    }
}
