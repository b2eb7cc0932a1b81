//! SIP parser.
//!
//! [`Parser`] scans one message worth of bytes into the typed message
//! model; [`decode`] wraps it with the transport-facing envelope that
//! handles stream framing, mandatory-header validation, and the canned
//! 400 template for malformed requests.

use std::str;
use std::sync::Arc;

use bytes::Bytes;
use sipcore_util::util::{is_alphabetic, is_newline, is_space};
use sipcore_util::Scanner;

use crate::error::{Result, SipParseError};
use crate::headers::*;
use crate::macros::b_map;
use crate::message::{
    Host, HostPort, NameAddr, Param, Params, Request, RequestLine, Response, Scheme, SipAddr,
    SipMethod, SipMsg, StatusLine, TransportKind, Uri, UserInfo, SIPV2,
};

const ALPHA_NUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const UNRESERVED: &[u8] = b"-_.!~*'()";
const ESCAPED: &[u8] = b"%";
const USER_UNRESERVED: &[u8] = b"&=+$,;?/";
const TOKEN: &[u8] = b"-.!%*_`'~+";
const PASS: &[u8] = b"&=+$,";
const HOST: &[u8] = b"_-.";

// For reading the user part of a URI.
b_map!(USER_MAP => ALPHA_NUM, UNRESERVED, USER_UNRESERVED, ESCAPED);
// For reading the password part of a URI.
b_map!(PASS_MAP => ALPHA_NUM, UNRESERVED, ESCAPED, PASS);
// For reading hosts.
b_map!(HOST_MAP => ALPHA_NUM, HOST);
// For reading URI parameters.
b_map!(PARAM_MAP => b"[]/:&+$", ALPHA_NUM, UNRESERVED, ESCAPED);
// For reading URI headers.
b_map!(HDR_MAP => b"[]/?:+$", ALPHA_NUM, UNRESERVED, ESCAPED);
// For reading tokens.
b_map!(TOKEN_MAP => ALPHA_NUM, TOKEN);
// For reading header parameter values.
b_map!(PARAM_VALUE_MAP => b"[]:", ALPHA_NUM, TOKEN);

/// A type for parsing SIP messages.
///
/// Provides methods for parsing the components of SIP messages:
/// start lines, headers, URIs, and parameter lists.
pub struct Parser<'buf> {
    scanner: Scanner<'buf>,
}

impl<'buf> Parser<'buf> {
    /// Creates a new `Parser` over the given slice.
    pub fn new(buf: &'buf [u8]) -> Self {
        Self {
            scanner: Scanner::new(buf),
        }
    }

    /// Index of the next unread byte.
    pub fn offset(&self) -> usize {
        self.scanner.offset()
    }

    pub(crate) fn parse_failure<T>(&self, msg: &str) -> Result<T> {
        let pos = self.scanner.position();
        Err(SipParseError::new(format!("{msg} (line {}, col {})", pos.line(), pos.col())).into())
    }

    pub(crate) fn ws(&mut self) {
        self.scanner.read_while(is_space);
    }

    pub(crate) fn eat(&mut self, pat: &[u8]) -> bool {
        self.scanner.eat(pat)
    }

    fn eat_byte(&mut self, byte: u8) -> bool {
        self.scanner.consume_if(|b| b == byte).is_some()
    }

    pub(crate) fn must_read(&mut self, byte: u8) -> Result<()> {
        self.scanner.must_read(byte)?;
        Ok(())
    }

    /// Consumes optional whitespace followed by one line ending.
    fn eol(&mut self) -> Result<()> {
        self.ws();
        if self.eat(b"\r\n") || self.eat(b"\n") {
            Ok(())
        } else if self.scanner.is_eof() {
            Ok(())
        } else {
            self.parse_failure("Expected end of line")
        }
    }

    /// Reads one token (RFC 3261 §25.1).
    pub(crate) fn parse_token(&mut self) -> Result<&'buf str> {
        let token = self.scanner.read_str(|b| TOKEN_MAP[b as usize]);
        if token.is_empty() {
            return self.parse_failure("Expected token");
        }
        Ok(token)
    }

    pub(crate) fn parse_u32(&mut self) -> Result<u32> {
        Ok(self.scanner.read_u32()?)
    }

    /// Reads the rest of the line without consuming the line ending,
    /// trailing whitespace trimmed.
    pub(crate) fn read_line_str(&mut self) -> &'buf str {
        let bytes = self.scanner.read_while(|b| !is_newline(b));
        let s = str::from_utf8(bytes).unwrap_or_default();
        s.trim_end_matches([' ', '\t'])
    }

    pub(crate) fn read_while_str<F>(&mut self, func: F) -> &'buf str
    where
        F: Fn(u8) -> bool,
    {
        self.scanner.read_str(func)
    }

    /// Consumes `SIP/2.0/` at the head of a Via value.
    pub(crate) fn expect_sip_v2_slash(&mut self) -> Result<()> {
        if self.eat(b"SIP/2.0/") {
            Ok(())
        } else {
            self.parse_failure("Expected SIP/2.0/")
        }
    }

    /// Parses a quoted string, the opening quote already consumed.
    /// Returns the content without the surrounding quotes; escapes are
    /// kept verbatim.
    fn parse_quoted_content(&mut self) -> Result<&'buf str> {
        let start = self.scanner.offset();
        loop {
            match self.scanner.advance() {
                Some(b'"') => {
                    let end = self.scanner.offset() - 1;
                    let bytes = &self.scanner.src()[start..end];
                    return str::from_utf8(bytes)
                        .map_err(|_| SipParseError::new("Invalid UTF-8 in quoted string").into());
                }
                Some(b'\\') => {
                    self.scanner.advance();
                }
                Some(b'\r') | Some(b'\n') | None => {
                    return self.parse_failure("Unterminated quoted string");
                }
                Some(_) => (),
            }
        }
    }

    /// Parses a host with optional port.
    pub(crate) fn parse_host_port(&mut self) -> Result<HostPort> {
        let host = if self.eat_byte(b'[') {
            let ip = self.scanner.take_until(b']');
            let ip = str::from_utf8(ip).map_err(SipParseError::from)?;
            let ip: std::net::Ipv6Addr = ip
                .parse()
                .map_err(|_| SipParseError::new("Invalid IPv6 literal"))?;
            self.must_read(b']')?;
            Host::IpAddr(ip.into())
        } else {
            let host = self.scanner.read_str(|b| HOST_MAP[b as usize]);
            if host.is_empty() {
                return self.parse_failure("Expected host");
            }
            match host.parse::<std::net::IpAddr>() {
                Ok(ip) => Host::IpAddr(ip),
                Err(_) => Host::DomainName(host.into()),
            }
        };

        let port = if self.eat_byte(b':') {
            Some(self.scanner.read_u16()?)
        } else {
            None
        };

        Ok(HostPort { host, port })
    }

    /// Parses a URI. When `parse_params` is `false` the URI ends before
    /// any `;` so that header parameters stay with the header
    /// (RFC 3261 §20.10).
    pub fn parse_uri(&mut self, parse_params: bool) -> Result<Uri> {
        let scheme_str = self.scanner.read_str(is_alphabetic);
        self.must_read(b':')?;

        let scheme = if scheme_str.eq_ignore_ascii_case("sip") {
            Scheme::Sip
        } else if scheme_str.eq_ignore_ascii_case("sips") {
            Scheme::Sips
        } else if scheme_str.eq_ignore_ascii_case("tel") {
            Scheme::Tel
        } else if scheme_str.eq_ignore_ascii_case("mailto") {
            Scheme::Mailto
        } else {
            return self.parse_failure("Unsupported URI scheme");
        };

        if matches!(scheme, Scheme::Tel | Scheme::Mailto) {
            let opaque = self
                .scanner
                .read_str(|b| !matches!(b, b';' | b'?' | b'>' | b' ' | b',') && !is_newline(b));
            if opaque.is_empty() {
                return self.parse_failure("Empty URI");
            }
            let mut uri = Uri::new(Host::DomainName("".into()), None);
            uri.scheme = scheme;
            uri.user = Some(UserInfo::new(opaque));
            if parse_params {
                self.parse_uri_params(&mut uri)?;
            }
            return Ok(uri);
        }

        // Userinfo is present when '@' occurs before the URI ends; the
        // user part may itself contain ';' and '?', so only the hard
        // terminators bound the scan.
        let line = self
            .scanner
            .peek_while(|b| !matches!(b, b'>' | b' ' | b',') && !is_newline(b));
        let has_user = line.iter().take_while(|&&b| b != b'?').any(|&b| b == b'@');

        let user = if has_user {
            let user = self.scanner.read_str(|b| USER_MAP[b as usize]);
            if user.is_empty() {
                return self.parse_failure("Empty user part");
            }
            let password = if self.eat_byte(b':') {
                Some(self.scanner.read_str(|b| PASS_MAP[b as usize]))
            } else {
                None
            };
            self.must_read(b'@')?;
            Some(UserInfo {
                user: user.into(),
                password: password.map(Into::into),
            })
        } else {
            None
        };

        let host_port = self.parse_host_port()?;

        let mut uri = Uri {
            scheme,
            user,
            host_port,
            transport_param: None,
            user_param: None,
            method_param: None,
            ttl_param: None,
            lr_param: false,
            maddr_param: None,
            gr_param: None,
            params: Params::new(),
            headers: Params::new(),
        };

        if parse_params {
            self.parse_uri_params(&mut uri)?;
        }

        Ok(uri)
    }

    fn parse_uri_params(&mut self, uri: &mut Uri) -> Result<()> {
        while self.eat_byte(b';') {
            let name = self
                .scanner
                .read_str(|b| PARAM_MAP[b as usize] && b != b'=');
            if name.is_empty() {
                return self.parse_failure("Empty URI parameter name");
            }
            let value = if self.eat_byte(b'=') {
                Some(self.scanner.read_str(|b| PARAM_MAP[b as usize]))
            } else {
                None
            };

            if name.eq_ignore_ascii_case("transport") {
                match value.and_then(|v| v.parse::<TransportKind>().ok()) {
                    Some(kind) => uri.transport_param = Some(kind),
                    None => return self.parse_failure("Invalid transport parameter"),
                }
            } else if name.eq_ignore_ascii_case("user") {
                uri.user_param = value.map(Into::into);
            } else if name.eq_ignore_ascii_case("method") {
                uri.method_param = value.map(Into::into);
            } else if name.eq_ignore_ascii_case("ttl") {
                uri.ttl_param = value.and_then(|v| v.parse().ok());
            } else if name.eq_ignore_ascii_case("lr") {
                uri.lr_param = true;
            } else if name.eq_ignore_ascii_case("maddr") {
                uri.maddr_param = value.map(|v| match v.parse() {
                    Ok(ip) => Host::IpAddr(ip),
                    Err(_) => Host::DomainName(v.into()),
                });
            } else if name.eq_ignore_ascii_case("gr") {
                uri.gr_param = Some(value.map(Into::into));
            } else {
                uri.params.push(Param::new(name, value));
            }
        }

        if self.eat_byte(b'?') {
            loop {
                let name = self
                    .scanner
                    .read_str(|b| HDR_MAP[b as usize] && b != b'=' && b != b'&');
                if name.is_empty() {
                    return self.parse_failure("Empty URI header name");
                }
                let value = if self.eat_byte(b'=') {
                    Some(self.scanner.read_str(|b| HDR_MAP[b as usize] && b != b'&'))
                } else {
                    None
                };
                uri.headers.push(Param::new(name, value));
                if !self.eat_byte(b'&') {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Parses a `name-addr` or plain `addr-spec`.
    pub fn parse_sip_addr(&mut self) -> Result<SipAddr> {
        self.ws();
        match self.scanner.peek() {
            Some(b'"') => {
                self.scanner.advance();
                let display = self.parse_quoted_content()?;
                self.ws();
                self.must_read(b'<')?;
                let uri = self.parse_uri(true)?;
                self.must_read(b'>')?;
                Ok(SipAddr::NameAddr(NameAddr {
                    display: Some(display.into()),
                    uri,
                }))
            }
            Some(b'<') => {
                self.scanner.advance();
                let uri = self.parse_uri(true)?;
                self.must_read(b'>')?;
                Ok(SipAddr::NameAddr(NameAddr { display: None, uri }))
            }
            _ => {
                let line = self.scanner.peek_while(|b| !is_newline(b) && b != b',');
                match line.iter().position(|&b| b == b'<') {
                    Some(pos) => {
                        let display = str::from_utf8(&line[..pos])
                            .map_err(SipParseError::from)?
                            .trim();
                        let display = (!display.is_empty()).then(|| Arc::from(display));
                        self.scanner.advance_n(pos + 1);
                        let uri = self.parse_uri(true)?;
                        self.must_read(b'>')?;
                        Ok(SipAddr::NameAddr(NameAddr { display, uri }))
                    }
                    None => Ok(SipAddr::Uri(self.parse_uri(false)?)),
                }
            }
        }
    }

    /// Parses a `;name[=value]` list, stopping before a comma or the
    /// end of the line. Quoted values are kept with their quotes.
    pub(crate) fn parse_header_params(&mut self) -> Result<Params> {
        let mut params = Params::new();
        loop {
            self.ws();
            if !self.eat_byte(b';') {
                break;
            }
            self.ws();
            let name = self
                .scanner
                .read_str(|b| TOKEN_MAP[b as usize] && b != b'=');
            if name.is_empty() {
                return self.parse_failure("Empty parameter name");
            }
            self.ws();
            let value = if self.eat_byte(b'=') {
                self.ws();
                if self.eat_byte(b'"') {
                    let content = self.parse_quoted_content()?;
                    Some(Arc::from(format!("\"{content}\"")))
                } else {
                    let value = self.scanner.read_str(|b| PARAM_VALUE_MAP[b as usize]);
                    Some(Arc::from(value))
                }
            } else {
                None
            };
            params.push(Param {
                name: name.into(),
                value,
            });
        }
        Ok(params)
    }

    /// Parses a comma-separated token list.
    pub(crate) fn parse_token_list(&mut self) -> Result<Vec<Arc<str>>> {
        let mut tags = Vec::new();
        loop {
            self.ws();
            if self.scanner.peek().is_none_or(is_newline) {
                break;
            }
            let token = self.parse_token()?;
            tags.push(Arc::from(token));
            self.ws();
            if !self.eat_byte(b',') {
                break;
            }
        }
        Ok(tags)
    }

    /// Parses the start line of a SIP message.
    pub fn parse_start_line(&mut self) -> Result<SipMsg> {
        if self.scanner.starts_with(b"SIP/2.0 ") {
            self.eat(SIPV2.as_bytes());
            self.ws();
            let code: u16 = self.scanner.read_num()?;
            if !(100..700).contains(&code) {
                return self.parse_failure("Invalid status code");
            }
            self.ws();
            let reason = self.read_line_str();
            self.eol()?;
            let status_line = StatusLine::new(code.into(), reason);
            return Ok(Response::new(status_line).into());
        }

        let method: SipMethod = self.parse_token()?.into();
        self.must_read(b' ')?;
        let uri = match self.parse_uri(true) {
            Ok(uri) => uri,
            Err(_) => return self.parse_failure("Invalid Request-URI"),
        };
        if self.must_read(b' ').is_err() || !self.eat(SIPV2.as_bytes()) {
            return self.parse_failure("Invalid Request-URI");
        }
        self.eol()?;

        Ok(Request {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: None,
        }
        .into())
    }

    /// Parses a start line plus all headers, leaving the parser
    /// positioned right after the blank line. The body is framed by
    /// [`decode`], which knows the transport.
    pub fn parse_sip_msg(&mut self) -> Result<SipMsg> {
        let mut msg = self.parse_start_line()?;
        let headers = msg.headers_mut();

        loop {
            if self.eat(b"\r\n") || self.eat(b"\n") {
                break;
            }
            if self.scanner.is_eof() {
                break;
            }

            let name = self.parse_token()?;
            self.ws();
            self.must_read(b':')?;
            self.ws();

            if Via::matches_name(name) {
                self.parse_comma_separated(headers, |parser| Ok(Header::Via(Via::parse(parser)?)))?;
            } else if Contact::matches_name(name) {
                self.parse_comma_separated(headers, |parser| {
                    Ok(Header::Contact(Contact::parse(parser)?))
                })?;
            } else if Route::matches_name(name) {
                self.parse_comma_separated(headers, |parser| {
                    Ok(Header::Route(Route::parse(parser)?))
                })?;
            } else if RecordRoute::matches_name(name) {
                self.parse_comma_separated(headers, |parser| {
                    Ok(Header::RecordRoute(RecordRoute::parse(parser)?))
                })?;
            } else if Path::matches_name(name) {
                self.parse_comma_separated(headers, |parser| Ok(Header::Path(Path::parse(parser)?)))?;
            } else if From::matches_name(name) {
                headers.push(Header::From(From::parse(self)?));
                self.eol()?;
            } else if To::matches_name(name) {
                headers.push(Header::To(To::parse(self)?));
                self.eol()?;
            } else if CallId::matches_name(name) {
                headers.push(Header::CallId(CallId::parse(self)?));
                self.eol()?;
            } else if CSeq::matches_name(name) {
                headers.push(Header::CSeq(CSeq::parse(self)?));
                self.eol()?;
            } else if MaxForwards::matches_name(name) {
                headers.push(Header::MaxForwards(MaxForwards::parse(self)?));
                self.eol()?;
            } else if Expires::matches_name(name) {
                headers.push(Header::Expires(Expires::parse(self)?));
                self.eol()?;
            } else if MinExpires::matches_name(name) {
                headers.push(Header::MinExpires(MinExpires::parse(self)?));
                self.eol()?;
            } else if ContentLength::matches_name(name) {
                headers.push(Header::ContentLength(ContentLength::parse(self)?));
                self.eol()?;
            } else if ContentType::matches_name(name) {
                headers.push(Header::ContentType(ContentType::parse(self)?));
                self.eol()?;
            } else if Require::matches_name(name) {
                headers.push(Header::Require(Require::parse(self)?));
                self.eol()?;
            } else if Supported::matches_name(name) {
                headers.push(Header::Supported(Supported::parse(self)?));
                self.eol()?;
            } else if Unsupported::matches_name(name) {
                headers.push(Header::Unsupported(Unsupported::parse(self)?));
                self.eol()?;
            } else if ProxyRequire::matches_name(name) {
                headers.push(Header::ProxyRequire(ProxyRequire::parse(self)?));
                self.eol()?;
            } else if Allow::matches_name(name) {
                headers.push(Header::Allow(Allow::parse(self)?));
                self.eol()?;
            } else if Event::matches_name(name) {
                headers.push(Header::Event(Event::parse(self)?));
                self.eol()?;
            } else if SubscriptionState::matches_name(name) {
                headers.push(Header::SubscriptionState(SubscriptionState::parse(self)?));
                self.eol()?;
            } else if Date::matches_name(name) {
                headers.push(Header::Date(Date::parse(self)?));
                self.eol()?;
            } else if WwwAuthenticate::matches_name(name) {
                headers.push(Header::WwwAuthenticate(WwwAuthenticate::parse(self)?));
                self.eol()?;
            } else if ProxyAuthenticate::matches_name(name) {
                headers.push(Header::ProxyAuthenticate(ProxyAuthenticate::parse(self)?));
                self.eol()?;
            } else if ProxyAuthorization::matches_name(name) {
                headers.push(Header::ProxyAuthorization(ProxyAuthorization::parse(self)?));
                self.eol()?;
            } else if Authorization::matches_name(name) {
                headers.push(Header::Authorization(Authorization::parse(self)?));
                self.eol()?;
            } else {
                let value = self.read_line_str();
                headers.push(Header::Other {
                    name: name.into(),
                    value: value.into(),
                });
                self.eol()?;
            }
        }

        Ok(msg)
    }

    fn parse_comma_separated<F>(&mut self, headers: &mut Headers, mut parse_one: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<Header>,
    {
        loop {
            headers.push(parse_one(self)?);
            self.ws();
            if !self.eat_byte(b',') {
                break;
            }
            self.ws();
        }
        self.eol()
    }
}

/// The outcome of decoding a byte buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A full message was parsed; `consumed` bytes were used and the
    /// rest of the buffer belongs to the next message.
    Complete {
        msg: SipMsg,
        consumed: usize,
    },
    /// More bytes are needed. Only meaningful on stream transports.
    Partial,
    /// The request is malformed but syntactically complete enough for
    /// a canned 400 answer.
    ReplyError {
        reason: SipParseError,
        reply: Bytes,
    },
    /// The buffer is not a usable SIP message.
    Error(SipParseError),
}

/// Decodes one SIP message from `buf` as received over `kind`.
pub fn decode(buf: &[u8], kind: TransportKind) -> ParseOutcome {
    let header_end = find_header_end(buf);

    if header_end.is_none() {
        if kind.is_stream() {
            return ParseOutcome::Partial;
        }
        return malformed(buf, SipParseError::new("Truncated message"));
    }

    let mut parser = Parser::new(buf);
    let mut msg = match parser.parse_sip_msg() {
        Ok(msg) => msg,
        Err(err) => {
            let reason = parse_reason(err);
            return malformed(buf, reason);
        }
    };

    if let Err(reason) = validate(&msg) {
        return malformed_msg(buf, &msg, reason);
    }

    let offset = parser.offset();
    let rest = &buf[offset..];
    let content_length = msg.headers().content_length().map(|cl| cl.get() as usize);

    let (body, consumed) = if kind.is_stream() {
        let Some(len) = content_length else {
            return malformed_msg(buf, &msg, SipParseError::new("Missing Content-Length"));
        };
        if rest.len() < len {
            return ParseOutcome::Partial;
        }
        (&rest[..len], offset + len)
    } else {
        match content_length {
            Some(len) if rest.len() < len => {
                return malformed_msg(buf, &msg, SipParseError::new("Invalid Content-Length"));
            }
            Some(len) => (&rest[..len], offset + len),
            // Without Content-Length the body is the rest of the datagram.
            None => (rest, buf.len()),
        }
    };

    if !body.is_empty() {
        msg.set_body(Some(Bytes::copy_from_slice(body)));
    }

    ParseOutcome::Complete { msg, consumed }
}

/// Checks the mandatory-header contract of RFC 3261 §8.1.1.
fn validate(msg: &SipMsg) -> std::result::Result<(), SipParseError> {
    let headers = msg.headers();
    let mut from = 0;
    let mut to = 0;
    let mut call_id = 0;
    let mut cseq = 0;
    let mut via = 0;

    for header in headers.iter() {
        match header {
            Header::From(_) => from += 1,
            Header::To(_) => to += 1,
            Header::CallId(_) => call_id += 1,
            Header::CSeq(_) => cseq += 1,
            Header::Via(_) => via += 1,
            _ => (),
        }
    }

    let check = |count: usize, name: &str| match count {
        1 => Ok(()),
        0 => Err(SipParseError::new(format!("Missing {name}"))),
        _ => Err(SipParseError::new(format!("Duplicated {name}"))),
    };

    check(from, "From")?;
    check(to, "To")?;
    check(call_id, "Call-ID")?;
    check(cseq, "CSeq")?;
    if via == 0 {
        return Err(SipParseError::new("Missing Via"));
    }

    if let SipMsg::Request(request) = msg {
        let cseq = headers.cseq().expect("counted above");
        if cseq.method() != request.method() {
            return Err(SipParseError::new("Invalid CSeq"));
        }
    }

    Ok(())
}

fn parse_reason(err: crate::Error) -> SipParseError {
    match err {
        crate::Error::Parse(reason) => reason,
        other => SipParseError::new(other.to_string()),
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn malformed(buf: &[u8], reason: SipParseError) -> ParseOutcome {
    if looks_like_request(buf) {
        let reply = canned_400(buf, &reason);
        ParseOutcome::ReplyError { reason, reply }
    } else {
        ParseOutcome::Error(reason)
    }
}

fn malformed_msg(buf: &[u8], msg: &SipMsg, reason: SipParseError) -> ParseOutcome {
    if msg.is_request() {
        let reply = canned_400(buf, &reason);
        ParseOutcome::ReplyError { reason, reply }
    } else {
        ParseOutcome::Error(reason)
    }
}

fn looks_like_request(buf: &[u8]) -> bool {
    let line_end = buf
        .iter()
        .position(|&b| is_newline(b))
        .unwrap_or(buf.len());
    let line = &buf[..line_end];
    !line.starts_with(b"SIP/2.0") && line.ends_with(b"SIP/2.0")
}

/// Builds the canned 400 answer for a malformed request by echoing the
/// raw core header lines.
fn canned_400(buf: &[u8], reason: &SipParseError) -> Bytes {
    use std::fmt::Write;

    let mut out = String::with_capacity(256);
    let _ = write!(out, "SIP/2.0 400 {}\r\n", reason.message);

    let head_len = find_header_end(buf).unwrap_or(buf.len());
    for line in buf[..head_len].split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = str::from_utf8(&line[..colon]).unwrap_or_default().trim();
        let echo = Via::matches_name(name)
            || From::matches_name(name)
            || To::matches_name(name)
            || CallId::matches_name(name)
            || CSeq::matches_name(name);
        if echo {
            if let Ok(line) = str::from_utf8(line) {
                let _ = write!(out, "{line}\r\n");
            }
        }
    }

    let _ = write!(out, "Content-Length: 0\r\n\r\n");
    Bytes::from(out)
}
