use core::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::message::{Host, HostPort, Params, TransportKind, SIPV2};
use crate::parser::Parser;

const BRANCH_PARAM: &str = "branch";
const TTL_PARAM: &str = "ttl";
const MADDR_PARAM: &str = "maddr";
const RECEIVED_PARAM: &str = "received";
const RPORT_PARAM: &str = "rport";

/// The magic cookie every RFC 3261 branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the path that
/// should be followed in routing responses.
///
/// # Examples
/// ```
/// # use sipcore::headers::Via;
/// # use sipcore::headers::HeaderParse;
/// let via = Via::from_bytes(
///     b"SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8",
/// ).unwrap();
///
/// assert_eq!(via.branch(), Some("z9hG4bKnashds8"));
/// ```
#[derive(Debug, PartialEq, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    ttl: Option<u8>,
    maddr: Option<Host>,
    received: Option<IpAddr>,
    branch: Option<Arc<str>>,
    /// `None` = absent, `Some(None)` = bare `;rport` flag,
    /// `Some(Some(p))` = filled in by the server (RFC 3581).
    rport: Option<Option<u16>>,
    params: Params,
}

impl Via {
    /// Creates a `Via` for `transport` sent by `sent_by` with `branch`.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: impl Into<Arc<str>>) -> Self {
        Self {
            transport,
            sent_by,
            ttl: None,
            maddr: None,
            received: None,
            branch: Some(branch.into()),
            rport: None,
            params: Params::new(),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    pub fn set_sent_by(&mut self, sent_by: HostPort) {
        self.sent_by = sent_by;
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn branch_arc(&self) -> Option<Arc<str>> {
        self.branch.clone()
    }

    /// `true` when the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }

    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Records where the request actually came from (RFC 3581 §4).
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// The `rport` value filled in by the server, if any.
    pub fn rport(&self) -> Option<u16> {
        self.rport.flatten()
    }

    /// `true` when the sender asked for symmetric response routing.
    pub fn rport_requested(&self) -> bool {
        matches!(self.rport, Some(None))
    }

    pub fn set_rport(&mut self, port: u16) {
        self.rport = Some(Some(port));
    }

    pub fn maddr(&self) -> Option<&Host> {
        self.maddr.as_ref()
    }

    /// Records origin per RFC 3581: always set `received`, and fill in
    /// `rport` when the sender requested it.
    pub fn stamp_origin(&mut self, origin: SocketAddr) {
        self.set_received(origin.ip());
        if self.rport_requested() {
            self.set_rport(origin.port());
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} {}", Via::NAME, SIPV2, self.transport, self.sent_by)?;

        match self.rport {
            Some(Some(rport)) => write!(f, ";rport={rport}")?,
            Some(None) => write!(f, ";rport")?,
            None => (),
        }
        if let Some(received) = &self.received {
            write!(f, ";received={received}")?;
        }
        if let Some(ttl) = &self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={maddr}")?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={branch}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl HeaderParse for Via {
    const NAME: &'static str = "Via";
    const SHORT_NAME: Option<&'static str> = Some("v");

    /*
     * Via         = ( "Via" / "v" ) HCOLON via-parm *(COMMA via-parm)
     * via-parm    = sent-protocol LWS sent-by *( SEMI via-params )
     * via-params  = via-ttl / via-maddr / via-received / via-branch
     *               / response-port / via-extension
     */
    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        parser.expect_sip_v2_slash()?;
        let transport: TransportKind = parser.parse_token()?.parse()?;

        parser.ws();

        let sent_by = parser.parse_host_port()?;
        let mut params = parser.parse_header_params()?;

        let branch = params.remove(BRANCH_PARAM).and_then(|p| p.value);
        let ttl = params
            .remove(TTL_PARAM)
            .and_then(|p| p.value)
            .and_then(|v| v.parse().ok());
        let received = params
            .remove(RECEIVED_PARAM)
            .and_then(|p| p.value)
            .and_then(|v| v.parse().ok());
        let maddr = params.remove(MADDR_PARAM).and_then(|p| p.value).map(|v| {
            match v.parse::<IpAddr>() {
                Ok(ip) => Host::IpAddr(ip),
                Err(_) => Host::DomainName(v),
            }
        });
        let rport = params.remove(RPORT_PARAM).map(|p| {
            p.value.and_then(|v| v.parse().ok())
        });

        Ok(Via {
            transport,
            sent_by,
            ttl,
            maddr,
            received,
            branch,
            rport,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse() {
        let src = b"SIP/2.0/UDP bobspc.biloxi.com:5060;received=192.0.2.4\r\n";
        let via = Via::from_bytes(src).unwrap();

        assert_eq!(via.transport, TransportKind::Udp);
        assert_eq!(
            via.sent_by,
            HostPort {
                host: Host::DomainName("bobspc.biloxi.com".into()),
                port: Some(5060)
            }
        );
        assert_eq!(via.received, Some("192.0.2.4".parse().unwrap()));

        let src = b"SIP/2.0/UDP 192.0.2.1:5060;received=192.0.2.207;branch=z9hG4bK77asjd\r\n";
        let via = Via::from_bytes(src).unwrap();

        assert_eq!(
            via.sent_by,
            HostPort {
                host: Host::IpAddr(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
                port: Some(5060)
            }
        );
        assert_eq!(via.received, Some("192.0.2.207".parse().unwrap()));
        assert_eq!(via.branch(), Some("z9hG4bK77asjd"));
        assert!(via.has_rfc3261_branch());
    }

    #[test]
    fn test_rport_flag_and_value() {
        let via = Via::from_bytes(b"SIP/2.0/TCP client.example.com;rport;branch=z9hG4bK87a\r\n").unwrap();
        assert!(via.rport_requested());
        assert_eq!(via.rport(), None);

        let mut via = via;
        via.stamp_origin("203.0.113.9:4540".parse().unwrap());
        assert_eq!(via.rport(), Some(4540));
        assert_eq!(via.received(), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_display_roundtrip() {
        let src = "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds";
        let via = Via::from_bytes(src.as_bytes()).unwrap();
        assert_eq!(via.to_string(), format!("Via: {src}"));
    }
}
