use std::fmt;
use std::sync::Arc;

use super::*;

/// A single SIP header.
///
/// Headers the stack interprets have typed variants; anything else is
/// kept verbatim in [`Header::Other`] with name and raw value.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Via(Via),
    From(From),
    To(To),
    CallId(CallId),
    CSeq(CSeq),
    MaxForwards(MaxForwards),
    Contact(Contact),
    Route(Route),
    RecordRoute(RecordRoute),
    Path(Path),
    Expires(Expires),
    MinExpires(MinExpires),
    ContentLength(ContentLength),
    ContentType(ContentType),
    Require(Require),
    Supported(Supported),
    Unsupported(Unsupported),
    ProxyRequire(ProxyRequire),
    Allow(Allow),
    Event(Event),
    SubscriptionState(SubscriptionState),
    Date(Date),
    WwwAuthenticate(WwwAuthenticate),
    ProxyAuthenticate(ProxyAuthenticate),
    Authorization(Authorization),
    ProxyAuthorization(ProxyAuthorization),
    /// Any other header, name and value preserved verbatim.
    Other { name: Arc<str>, value: Arc<str> },
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(h) => write!(f, "{h}"),
            Header::From(h) => write!(f, "{h}"),
            Header::To(h) => write!(f, "{h}"),
            Header::CallId(h) => write!(f, "{h}"),
            Header::CSeq(h) => write!(f, "{h}"),
            Header::MaxForwards(h) => write!(f, "{h}"),
            Header::Contact(h) => write!(f, "{h}"),
            Header::Route(h) => write!(f, "{h}"),
            Header::RecordRoute(h) => write!(f, "{h}"),
            Header::Path(h) => write!(f, "{h}"),
            Header::Expires(h) => write!(f, "{h}"),
            Header::MinExpires(h) => write!(f, "{h}"),
            Header::ContentLength(h) => write!(f, "{h}"),
            Header::ContentType(h) => write!(f, "{h}"),
            Header::Require(h) => write!(f, "{h}"),
            Header::Supported(h) => write!(f, "{h}"),
            Header::Unsupported(h) => write!(f, "{h}"),
            Header::ProxyRequire(h) => write!(f, "{h}"),
            Header::Allow(h) => write!(f, "{h}"),
            Header::Event(h) => write!(f, "{h}"),
            Header::SubscriptionState(h) => write!(f, "{h}"),
            Header::Date(h) => write!(f, "{h}"),
            Header::WwwAuthenticate(h) => write!(f, "{h}"),
            Header::ProxyAuthenticate(h) => write!(f, "{h}"),
            Header::Authorization(h) => write!(f, "{h}"),
            Header::ProxyAuthorization(h) => write!(f, "{h}"),
            Header::Other { name, value } => write!(f, "{name}: {value}"),
        }
    }
}
