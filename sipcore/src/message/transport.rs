use std::fmt;
use std::str::FromStr;

use crate::error::SipParseError;

/// The transport a SIP message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// UDP (datagram).
    #[default]
    Udp,
    /// TCP (stream).
    Tcp,
    /// TLS over TCP.
    Tls,
    /// SCTP.
    Sctp,
    /// WebSocket.
    Ws,
    /// Secure WebSocket.
    Wss,
}

impl TransportKind {
    /// The canonical token used in Via headers and `transport=` params.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Sctp => "SCTP",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Default port when the URI carries none (RFC 3261 §19.1.2,
    /// RFC 7118 for WS).
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp | TransportKind::Sctp => 5060,
            TransportKind::Tls | TransportKind::Wss => 5061,
            TransportKind::Ws => 80,
        }
    }

    /// Message boundaries must be found via Content-Length on these.
    pub fn is_stream(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }
}

impl FromStr for TransportKind {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("UDP") {
            Ok(TransportKind::Udp)
        } else if s.eq_ignore_ascii_case("TCP") {
            Ok(TransportKind::Tcp)
        } else if s.eq_ignore_ascii_case("TLS") {
            Ok(TransportKind::Tls)
        } else if s.eq_ignore_ascii_case("SCTP") {
            Ok(TransportKind::Sctp)
        } else if s.eq_ignore_ascii_case("WS") {
            Ok(TransportKind::Ws)
        } else if s.eq_ignore_ascii_case("WSS") {
            Ok(TransportKind::Wss)
        } else {
            Err(SipParseError::new(format!("unknown transport: {s}")))
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert_eq!("Tls".parse::<TransportKind>().unwrap(), TransportKind::Tls);
        assert!("quic".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(TransportKind::Udp.default_port(), 5060);
        assert_eq!(TransportKind::Tls.default_port(), 5061);
        assert_eq!(TransportKind::Wss.default_port(), 5061);
        assert_eq!(TransportKind::Ws.default_port(), 80);
    }
}
