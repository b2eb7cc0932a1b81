//! SIP header types.
//!
//! The module provides the [`Headers`] collection, the [`Header`] enum
//! covering the headers this stack interprets, and one module per typed
//! header. Headers outside the typed set are preserved verbatim as
//! [`Header::Other`].

mod allow;
mod authenticate;
mod call_id;
mod contact;
mod content_length;
mod content_type;
mod cseq;
mod date;
mod event;
mod expires;
mod from;
mod header;
mod max_forwards;
mod min_expires;
mod path;
mod proxy_require;
mod record_route;
mod require;
mod route;
mod subscription_state;
mod supported;
mod to;
mod unsupported;
mod via;

pub use allow::Allow;
pub use authenticate::{Authorization, ProxyAuthenticate, ProxyAuthorization, WwwAuthenticate};
pub use call_id::CallId;
pub use contact::{Contact, ContactAddr};
pub use content_length::ContentLength;
pub use content_type::ContentType;
pub use cseq::CSeq;
pub use date::Date;
pub use event::Event;
pub use expires::Expires;
pub use from::From;
pub use header::Header;
pub use max_forwards::MaxForwards;
pub use min_expires::MinExpires;
pub use path::Path;
pub use proxy_require::ProxyRequire;
pub use record_route::RecordRoute;
pub use require::Require;
pub use route::Route;
pub use subscription_state::SubscriptionState;
pub use supported::Supported;
pub use to::To;
pub use unsupported::Unsupported;
pub use via::{Via, BRANCH_MAGIC_COOKIE};

use std::fmt;

use crate::error::Result;
use crate::parser::Parser;

/// The tag parameter of [`From`] and [`To`] headers.
pub(crate) const TAG_PARAM: &str = "tag";

/// The q parameter of [`Contact`] headers.
pub(crate) const Q_PARAM: &str = "q";

/// The expires parameter of [`Contact`] headers.
pub(crate) const EXPIRES_PARAM: &str = "expires";

/// How a typed SIP header parses itself from a [`Parser`].
pub trait HeaderParse: Sized {
    /// The full header name (e.g. `"Contact"`).
    const NAME: &'static str;
    /// The compact form, if the header has one (e.g. `"f"` for `From`).
    const SHORT_NAME: Option<&'static str> = None;

    /// Checks whether `name` names this header, long or compact,
    /// case-insensitively.
    fn matches_name(name: &str) -> bool {
        name.eq_ignore_ascii_case(Self::NAME)
            || Self::SHORT_NAME.is_some_and(|short| name.eq_ignore_ascii_case(short))
    }

    /// Parses the header value (everything after the colon).
    fn parse(parser: &mut Parser<'_>) -> Result<Self>;

    /// Parses the header value from a byte slice.
    fn from_bytes(src: &[u8]) -> Result<Self> {
        Self::parse(&mut Parser::new(src))
    }
}

/// An ordered collection of SIP headers.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty collection.
    pub const fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Headers(Vec::with_capacity(capacity))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn insert(&mut self, index: usize, header: Header) {
        self.0.insert(index, header);
    }

    pub fn remove(&mut self, index: usize) -> Header {
        self.0.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.0.iter_mut()
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Header) -> bool,
    {
        self.0.retain(f);
    }

    /// Appends all of `other`, draining it.
    pub fn append(&mut self, other: &mut Headers) {
        self.0.append(&mut other.0);
    }

    /// The topmost `Via` header, if any.
    pub fn via(&self) -> Option<&Via> {
        self.0.iter().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    pub fn via_mut(&mut self) -> Option<&mut Via> {
        self.0.iter_mut().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// All `Via` headers, topmost first.
    pub fn vias(&self) -> impl Iterator<Item = &Via> {
        self.0.iter().filter_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// Removes and returns the topmost `Via`.
    pub fn pop_via(&mut self) -> Option<Via> {
        let idx = self.0.iter().position(|h| matches!(h, Header::Via(_)))?;
        match self.0.remove(idx) {
            Header::Via(via) => Some(via),
            _ => unreachable!(),
        }
    }

    pub fn from_hdr(&self) -> Option<&From> {
        self.0.iter().find_map(|h| match h {
            Header::From(from) => Some(from),
            _ => None,
        })
    }

    pub fn to_hdr(&self) -> Option<&To> {
        self.0.iter().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    pub fn to_hdr_mut(&mut self) -> Option<&mut To> {
        self.0.iter_mut().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(call_id) => Some(call_id),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq(cseq) => Some(cseq),
            _ => None,
        })
    }

    pub fn max_forwards(&self) -> Option<&MaxForwards> {
        self.0.iter().find_map(|h| match h {
            Header::MaxForwards(mf) => Some(mf),
            _ => None,
        })
    }

    pub fn max_forwards_mut(&mut self) -> Option<&mut MaxForwards> {
        self.0.iter_mut().find_map(|h| match h {
            Header::MaxForwards(mf) => Some(mf),
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<&Expires> {
        self.0.iter().find_map(|h| match h {
            Header::Expires(expires) => Some(expires),
            _ => None,
        })
    }

    pub fn content_length(&self) -> Option<&ContentLength> {
        self.0.iter().find_map(|h| match h {
            Header::ContentLength(cl) => Some(cl),
            _ => None,
        })
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.0.iter().find_map(|h| match h {
            Header::ContentType(ct) => Some(ct),
            _ => None,
        })
    }

    pub fn event(&self) -> Option<&Event> {
        self.0.iter().find_map(|h| match h {
            Header::Event(event) => Some(event),
            _ => None,
        })
    }

    pub fn subscription_state(&self) -> Option<&SubscriptionState> {
        self.0.iter().find_map(|h| match h {
            Header::SubscriptionState(ss) => Some(ss),
            _ => None,
        })
    }

    /// All `Contact` headers, in order.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.0.iter().filter_map(|h| match h {
            Header::Contact(contact) => Some(contact),
            _ => None,
        })
    }

    /// All `Route` headers, in order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.0.iter().filter_map(|h| match h {
            Header::Route(route) => Some(route),
            _ => None,
        })
    }

    /// Removes and returns the topmost `Route`.
    pub fn pop_route(&mut self) -> Option<Route> {
        let idx = self.0.iter().position(|h| matches!(h, Header::Route(_)))?;
        match self.0.remove(idx) {
            Header::Route(route) => Some(route),
            _ => unreachable!(),
        }
    }

    /// All `Record-Route` headers, in order.
    pub fn record_routes(&self) -> impl DoubleEndedIterator<Item = &RecordRoute> {
        self.0.iter().filter_map(|h| match h {
            Header::RecordRoute(rr) => Some(rr),
            _ => None,
        })
    }

    /// The first `Require` option tags iterator, flattened across headers.
    pub fn require_tags(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter_map(|h| match h {
                Header::Require(require) => Some(require.tags()),
                _ => None,
            })
            .flatten()
    }

    pub fn supported_tags(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter_map(|h| match h {
                Header::Supported(supported) => Some(supported.tags()),
                _ => None,
            })
            .flatten()
    }

    /// The raw values of every residual header named `name`.
    pub fn raw_values<'h>(&'h self, name: &'h str) -> impl Iterator<Item = &'h str> {
        self.0.iter().filter_map(move |h| match h {
            Header::Other { name: n, value } if n.eq_ignore_ascii_case(name) => Some(&**value),
            _ => None,
        })
    }
}

impl std::convert::From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Headers(headers)
    }
}

impl<const N: usize> std::convert::From<[Header; N]> for Headers {
    fn from(headers: [Header; N]) -> Self {
        Headers(headers.into())
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::ops::Index<usize> for Headers {
    type Output = Header;

    fn index(&self, index: usize) -> &Header {
        &self.0[index]
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for header in self.iter() {
            write!(f, "{header}\r\n")?;
        }
        Ok(())
    }
}
