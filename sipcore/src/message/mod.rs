//! SIP message types.
//!
//! The module provides the [`SipMsg`] enum that can be a
//! [`SipMsg::Request`] or [`SipMsg::Response`], together with the
//! method, status-code, URI, and parameter types they are built from.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use enum_as_inner::EnumAsInner;

use crate::headers::Headers;

mod code;
mod method;
mod params;
mod transport;
mod uri;

pub use code::*;
pub use method::*;
pub use params::*;
pub use transport::*;
pub use uri::*;

pub(crate) const SIPV2: &str = "SIP/2.0";

/// A SIP message, either request or response.
#[derive(Debug, EnumAsInner)]
pub enum SipMsg {
    /// A SIP request.
    Request(Request),
    /// A SIP response.
    Response(Response),
}

impl SipMsg {
    /// Returns a reference to the headers of the message.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(req) => &req.headers,
            SipMsg::Response(res) => &res.headers,
        }
    }

    /// Returns a mutable reference to the headers of the message.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(req) => &mut req.headers,
            SipMsg::Response(res) => &mut res.headers,
        }
    }

    /// Returns the message body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMsg::Request(req) => req.body.as_ref(),
            SipMsg::Response(res) => res.body.as_ref(),
        }
    }

    /// Sets the message body. `None` removes it.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        match self {
            SipMsg::Request(req) => req.body = body,
            SipMsg::Response(res) => res.body = body,
        }
    }
}

impl From<Request> for SipMsg {
    fn from(request: Request) -> Self {
        SipMsg::Request(request)
    }
}

impl From<Response> for SipMsg {
    fn from(response: Response) -> Self {
        SipMsg::Response(response)
    }
}

/// The first line of a request: method and Request-URI.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    pub method: SipMethod,
    pub uri: Uri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, SIPV2)
    }
}

/// The first line of a response: status code and reason phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Arc<str>,
}

impl StatusLine {
    pub fn new(code: StatusCode, reason: impl Into<Arc<str>>) -> Self {
        StatusLine {
            code,
            reason: reason.into(),
        }
    }
}

impl From<StatusCode> for StatusLine {
    fn from(code: StatusCode) -> Self {
        StatusLine::new(code, code.reason())
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", SIPV2, self.code, self.reason)
    }
}

/// A SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub req_line: RequestLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: SipMethod, uri: Uri) -> Self {
        Request {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &SipMethod {
        &self.req_line.method
    }

    pub fn uri(&self) -> &Uri {
        &self.req_line.uri
    }
}

/// A SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_line: StatusLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status_line: StatusLine) -> Self {
        Response {
            status_line,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    pub fn reason(&self) -> &str {
        &self.status_line.reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_display() {
        let uri = Uri::from_static("sip:bob@biloxi.com").unwrap();
        let line = RequestLine {
            method: SipMethod::Invite,
            uri,
        };
        assert_eq!(line.to_string(), "INVITE sip:bob@biloxi.com SIP/2.0\r\n");
    }

    #[test]
    fn test_status_line_display() {
        let line = StatusLine::from(StatusCode::Ringing);
        assert_eq!(line.to_string(), "SIP/2.0 180 Ringing\r\n");
    }

    #[test]
    fn test_msg_accessors() {
        let uri = Uri::from_static("sip:bob@biloxi.com").unwrap();
        let msg: SipMsg = Request::new(SipMethod::Options, uri).into();
        assert!(msg.is_request());
        assert!(msg.body().is_none());
    }
}
