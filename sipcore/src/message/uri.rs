use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use super::{Params, SipMethod, TransportKind};
use crate::error::Error;
use crate::parser::Parser;

/// A URI scheme accepted in a Request-URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `sip:`
    Sip,
    /// `sips:`
    Sips,
    /// `tel:`
    Tel,
    /// `mailto:`
    Mailto,
}

impl Scheme {
    /// Lowercase canonical form; schemes compare case-insensitively.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Mailto => "mailto",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The user part of a URI, with optional password.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub user: Arc<str>,
    pub password: Option<Arc<str>>,
}

impl UserInfo {
    pub fn new(user: impl Into<Arc<str>>) -> Self {
        UserInfo {
            user: user.into(),
            password: None,
        }
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if let Some(password) = &self.password {
            write!(f, ":{password}")?;
        }
        Ok(())
    }
}

/// A host: domain name or literal IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    DomainName(Arc<str>),
    IpAddr(IpAddr),
}

impl Host {
    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Host::DomainName(name) => Some(name),
            Host::IpAddr(_) => None,
        }
    }

    /// Case-insensitive comparison for domain names.
    pub fn matches(&self, other: &Host) -> bool {
        match (self, other) {
            (Host::DomainName(a), Host::DomainName(b)) => a.eq_ignore_ascii_case(b),
            (Host::IpAddr(a), Host::IpAddr(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::DomainName(name) => write!(f, "{name}"),
            Host::IpAddr(IpAddr::V4(ip)) => write!(f, "{ip}"),
            Host::IpAddr(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
        }
    }
}

/// A host with its optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        HostPort { host, port }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl From<std::net::SocketAddr> for HostPort {
    fn from(addr: std::net::SocketAddr) -> Self {
        HostPort {
            host: Host::IpAddr(addr.ip()),
            port: Some(addr.port()),
        }
    }
}

/// A SIP URI.
///
/// The parameters the stack interprets are carried in dedicated fields;
/// everything else is preserved verbatim, in order, in `params` and
/// `headers`. For `tel:` and `mailto:` URIs the opaque part lives in
/// `user` and the host part is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<UserInfo>,
    pub host_port: HostPort,
    /// The `transport=` parameter, compared lowercase.
    pub transport_param: Option<TransportKind>,
    /// The `user=` parameter.
    pub user_param: Option<Arc<str>>,
    /// The `method=` parameter.
    pub method_param: Option<SipMethod>,
    /// The `ttl=` parameter.
    pub ttl_param: Option<u8>,
    /// The `lr` loose-routing flag.
    pub lr_param: bool,
    /// The `maddr=` parameter.
    pub maddr_param: Option<Host>,
    /// The `gr` GRUU parameter: absent, bare (`;gr`), or valued.
    pub gr_param: Option<Option<Arc<str>>>,
    /// Remaining URI parameters, order and case preserved.
    pub params: Params,
    /// URI headers (after `?`), order and case preserved.
    pub headers: Params,
}

impl Uri {
    /// A plain `sip:` URI for `host`.
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host_port: HostPort::new(host, port),
            transport_param: None,
            user_param: None,
            method_param: None,
            ttl_param: None,
            lr_param: false,
            maddr_param: None,
            gr_param: None,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    /// Parses a URI from a static string. Intended for literals in
    /// tests and builders.
    pub fn from_static(s: &'static str) -> crate::Result<Self> {
        s.parse()
    }

    /// The transport implied by this URI (RFC 3261 §19.1.2): the
    /// `transport=` parameter if present, else TLS for SIPS, else UDP.
    pub fn transport(&self) -> TransportKind {
        match self.transport_param {
            Some(kind) => kind,
            None if self.scheme == Scheme::Sips => TransportKind::Tls,
            None => TransportKind::Udp,
        }
    }

    /// The port to contact, falling back to the transport default.
    pub fn port_or_default(&self) -> u16 {
        self.host_port.port.unwrap_or_else(|| self.transport().default_port())
    }

    /// `true` when this URI carries the `gr` parameter (is a GRUU).
    pub fn is_gruu(&self) -> bool {
        self.gr_param.is_some()
    }

    /// The address-of-record key for this URI: `scheme:user@host`,
    /// host lowercased, ignoring port and parameters.
    pub fn aor(&self) -> String {
        let user = self.user.as_ref().map(|u| &*u.user).unwrap_or("");
        let host = self.host_port.host.to_string().to_ascii_lowercase();
        let scheme = if self.scheme == Scheme::Sips { Scheme::Sips } else { Scheme::Sip };
        format!("{scheme}:{user}@{host}")
    }

    fn write_params(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(transport) = self.transport_param {
            write!(f, ";transport={}", transport.as_str().to_ascii_lowercase())?;
        }
        if let Some(user) = &self.user_param {
            write!(f, ";user={user}")?;
        }
        if let Some(method) = &self.method_param {
            write!(f, ";method={method}")?;
        }
        if let Some(ttl) = self.ttl_param {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(maddr) = &self.maddr_param {
            write!(f, ";maddr={maddr}")?;
        }
        if self.lr_param {
            write!(f, ";lr")?;
        }
        match &self.gr_param {
            Some(Some(value)) => write!(f, ";gr={value}")?,
            Some(None) => write!(f, ";gr")?,
            None => (),
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tel | Scheme::Mailto => {
                write!(f, "{}:", self.scheme)?;
                if let Some(user) = &self.user {
                    write!(f, "{user}")?;
                }
                self.write_params(f)?;
                return Ok(());
            }
            Scheme::Sip | Scheme::Sips => {
                write!(f, "{}:", self.scheme)?;
            }
        }
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host_port)?;
        self.write_params(f)?;
        if !self.headers.is_empty() {
            write!(f, "?")?;
            for (i, header) in self.headers.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{header}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s.as_bytes());
        let uri = parser.parse_uri(true)?;
        Ok(uri)
    }
}

/// A URI with an optional display name, e.g. `"Alice" <sip:a@b>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<Arc<str>>,
    pub uri: Uri,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr { display: None, uri }
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{display}\" ")?;
        }
        write!(f, "<{}>", self.uri)
    }
}

/// Either a plain URI or a `name-addr` with display name and brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipAddr {
    /// A plain URI (e.g. `sip:user@example.com`).
    Uri(Uri),
    /// A bracketed address (e.g. `"Alice" <sip:user@example.com>`).
    NameAddr(NameAddr),
}

impl SipAddr {
    pub fn is_name_addr(&self) -> bool {
        matches!(self, SipAddr::NameAddr(_))
    }

    pub fn uri(&self) -> &Uri {
        match self {
            SipAddr::Uri(uri) => uri,
            SipAddr::NameAddr(name_addr) => &name_addr.uri,
        }
    }

    pub fn uri_mut(&mut self) -> &mut Uri {
        match self {
            SipAddr::Uri(uri) => uri,
            SipAddr::NameAddr(name_addr) => &mut name_addr.uri,
        }
    }

    pub fn into_uri(self) -> Uri {
        match self {
            SipAddr::Uri(uri) => uri,
            SipAddr::NameAddr(name_addr) => name_addr.uri,
        }
    }

    pub fn display(&self) -> Option<&str> {
        match self {
            SipAddr::Uri(_) => None,
            SipAddr::NameAddr(name_addr) => name_addr.display(),
        }
    }
}

impl From<Uri> for SipAddr {
    fn from(uri: Uri) -> Self {
        SipAddr::Uri(uri)
    }
}

impl From<NameAddr> for SipAddr {
    fn from(name_addr: NameAddr) -> Self {
        SipAddr::NameAddr(name_addr)
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr::Uri(uri) => write!(f, "{uri}"),
            SipAddr::NameAddr(name_addr) => write!(f, "{name_addr}"),
        }
    }
}

impl FromStr for SipAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s.as_bytes());
        parser.parse_sip_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_plain() {
        let uri: Uri = "sip:alice@example.com:5070".parse().unwrap();
        assert_eq!(uri.to_string(), "sip:alice@example.com:5070");
    }

    #[test]
    fn test_transport_defaults() {
        let uri: Uri = "sip:example.com".parse().unwrap();
        assert_eq!(uri.transport(), TransportKind::Udp);
        assert_eq!(uri.port_or_default(), 5060);

        let uri: Uri = "sips:example.com".parse().unwrap();
        assert_eq!(uri.transport(), TransportKind::Tls);
        assert_eq!(uri.port_or_default(), 5061);

        let uri: Uri = "sip:example.com;transport=tcp".parse().unwrap();
        assert_eq!(uri.transport(), TransportKind::Tcp);
    }

    #[test]
    fn test_aor_lowers_host_only() {
        let uri: Uri = "sip:Alice@EXAMPLE.com:5070;transport=tcp".parse().unwrap();
        assert_eq!(uri.aor(), "sip:Alice@example.com");
    }

    #[test]
    fn test_roundtrip_preserves_params() {
        let input = "sip:alice@example.com;lr;x-color=Blue?subject=hi";
        let uri: Uri = input.parse().unwrap();
        let reparsed: Uri = uri.to_string().parse().unwrap();
        assert_eq!(uri, reparsed);
    }

    #[test]
    fn test_gruu_param() {
        let uri: Uri = "sip:alice@example.com;gr=urn%3Auuid%3Aabc".parse().unwrap();
        assert!(uri.is_gruu());
        let uri: Uri = "sip:opaque123@example.com;gr".parse().unwrap();
        assert!(uri.is_gruu());
    }
}
