//! Request routing.
//!
//! When a request arrives with no matching transaction, the call
//! process asks the application what to do with it through
//! [`Application::route`]; the returned [`RouteVerdict`] drives the
//! outcome.

use std::sync::Arc;

use bytes::Bytes;

use crate::headers::{CallId, Header, Headers};
use crate::message::{Scheme, StatusCode, Uri};
use crate::transport::{IncomingRequest, IncomingResponse};

/// A response the application wants sent.
#[derive(Debug)]
pub struct SipReply {
    pub code: StatusCode,
    pub reason: Option<Arc<str>>,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl SipReply {
    pub fn new(code: StatusCode) -> Self {
        SipReply {
            code,
            reason: None,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn reason_str(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.code.reason())
    }
}

impl From<StatusCode> for SipReply {
    fn from(code: StatusCode) -> Self {
        SipReply::new(code)
    }
}

/// The closed set of options a proxy verdict can carry.
#[derive(Debug, Clone, Default)]
pub struct ProxyOpts {
    /// Headers inserted into the forwarded request.
    pub insert_headers: Vec<(Arc<str>, Arc<str>)>,
    /// Insert a Record-Route pointing at this proxy.
    pub record_route: bool,
    /// Follow 3xx responses by re-targeting (serial fork).
    pub follow_redirects: bool,
    /// Registrar outbound (RFC 5626) processing for this hop.
    pub outbound: bool,
    /// Insert a Path header (RFC 3327) on REGISTER forwarding.
    pub path: bool,
    /// Strip existing Route headers before forwarding.
    pub remove_routes: bool,
    /// Add a Contact for this proxy to the forwarded request.
    pub add_contact: bool,
    /// Replace the decremented Max-Forwards with this value.
    pub max_forwards_override: Option<u32>,
}

/// What the application decided for a new UAS request.
pub enum RouteVerdict {
    /// Consume locally (UAS handler chain).
    Process,
    /// Stateful proxy to the given targets; forks when more than one.
    ProxyTo(Vec<Uri>, ProxyOpts),
    /// Stateful proxy using the request's own Request-URI.
    ProxyRequestUri(ProxyOpts),
    /// Respond immediately through a server transaction.
    Reply(SipReply),
    /// Respond without creating server transaction state.
    ReplyStateless(SipReply),
}

/// Operations on the event compositor store (RFC 3903 PUBLISH state).
pub enum EventStoreOp {
    Get {
        key: Arc<str>,
    },
    Put {
        key: Arc<str>,
        value: Bytes,
        expires: u32,
    },
    Del {
        key: Arc<str>,
    },
}

/// The application port: routing and UAS callbacks.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait Application: Sync + Send + 'static {
    /// Decides the fate of a new out-of-dialog request.
    async fn route(
        &self,
        scheme: Scheme,
        user: &str,
        domain: &str,
        request: &IncomingRequest,
        call: &CallId,
    ) -> RouteVerdict {
        RouteVerdict::Process
    }

    /// Handles a PUBLISH consumed locally (RFC 3903).
    async fn publish(&self, request: &IncomingRequest) -> SipReply {
        SipReply::new(StatusCode::NotImplemented)
    }

    /// Reads or writes the event compositor state behind PUBLISH.
    async fn event_store(&self, op: EventStoreOp) -> Option<Bytes> {
        None
    }

    /// Handles a request the router marked `Process` (UAS chain).
    /// The default accepts OPTIONS and MESSAGE and rejects the rest.
    async fn on_request(&self, request: &IncomingRequest) -> SipReply {
        use crate::message::SipMethod::*;
        match request.method() {
            Options | Message | Info => SipReply::new(StatusCode::Ok),
            _ => SipReply::new(StatusCode::MethodNotAllowed),
        }
    }

    /// Observes a response delivered to the TU for a local UAC
    /// transaction (not proxied ones).
    async fn on_response(&self, response: &IncomingResponse) {}
}

/// The always-`Process` application used when none is configured.
pub struct DefaultApplication;

#[async_trait::async_trait]
impl Application for DefaultApplication {}

impl RouteVerdict {
    /// Splits the Request-URI the way `route` consumes it.
    pub(crate) fn request_uri_parts(uri: &Uri) -> (Scheme, String, String) {
        let user = uri
            .user
            .as_ref()
            .map(|u| u.user.to_string())
            .unwrap_or_default();
        let domain = uri.host_port.host.to_string();
        (uri.scheme, user, domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uri_parts() {
        let uri: Uri = "sips:carol@chicago.example.com:5061".parse().unwrap();
        let (scheme, user, domain) = RouteVerdict::request_uri_parts(&uri);
        assert_eq!(scheme, Scheme::Sips);
        assert_eq!(user, "carol");
        assert_eq!(domain, "chicago.example.com");
    }

    #[test]
    fn test_reply_reason_defaults_to_code() {
        let reply = SipReply::new(StatusCode::BusyHere);
        assert_eq!(reply.reason_str(), "Busy Here");
        let reply = reply.with_reason("Try later");
        assert_eq!(reply.reason_str(), "Try later");
    }
}
