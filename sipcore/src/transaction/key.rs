use std::sync::Arc;

use crate::headers::{Via, BRANCH_MAGIC_COOKIE};
use crate::message::{HostPort, SipMethod};
use crate::transport::{IncomingRequest, IncomingResponse, OutgoingRequest};

/// The matching key of a transaction (RFC 3261 §17.1.3 / §17.2.3).
///
/// The branch of the topmost Via plus the CSeq method is the primary
/// key; requests whose branch lacks the magic cookie fall back to the
/// RFC 2543 tuple. ACK always matches the INVITE transaction it
/// acknowledges; CANCEL constitutes its own transaction.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum TsxKey {
    Rfc3261(Rfc3261Key),
    Rfc2543(Box<Rfc2543Key>),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Rfc3261Key {
    Client {
        branch: Arc<str>,
        method: SipMethod,
    },
    Server {
        branch: Arc<str>,
        sent_by: HostPort,
        method: SipMethod,
    },
}

/// Fallback key for peers predating the magic cookie.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Rfc2543Key {
    pub cseq: u32,
    pub from_tag: Option<Arc<str>>,
    pub call_id: Arc<str>,
    pub via_sent_by: HostPort,
    pub method: SipMethod,
}

/// ACK belongs to the INVITE transaction it acknowledges.
fn normalize(method: &SipMethod) -> SipMethod {
    match method {
        SipMethod::Ack => SipMethod::Invite,
        other => other.clone(),
    }
}

impl TsxKey {
    /// Key for a client transaction created from an outgoing request.
    pub fn create_client(request: &OutgoingRequest) -> Self {
        let via = request.msg.headers.via().expect("outgoing request carries a Via");
        let cseq = request.msg.headers.cseq().expect("outgoing request carries a CSeq");
        let branch = via.branch_arc().expect("outgoing request branch is generated");

        TsxKey::Rfc3261(Rfc3261Key::Client {
            branch,
            method: normalize(cseq.method()),
        })
    }

    /// Key a response is matched against (branch of its topmost Via
    /// plus the CSeq method).
    pub fn create_client_for_response(response: &IncomingResponse) -> Self {
        let via = &response.core.via;
        let cseq = &response.core.cseq;

        match via.branch_arc() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => {
                TsxKey::Rfc3261(Rfc3261Key::Client {
                    branch,
                    method: normalize(cseq.method()),
                })
            }
            _ => TsxKey::Rfc2543(Box::new(Rfc2543Key {
                cseq: cseq.cseq,
                from_tag: response.core.from.tag().map(Arc::from),
                call_id: Arc::from(response.core.call_id.as_str()),
                via_sent_by: via.sent_by().clone(),
                method: normalize(cseq.method()),
            })),
        }
    }

    pub fn create_client_with(method: &SipMethod, branch: Arc<str>) -> Self {
        TsxKey::Rfc3261(Rfc3261Key::Client {
            branch,
            method: normalize(method),
        })
    }

    /// Key for a server transaction created from an incoming request.
    pub fn create_server(request: &IncomingRequest) -> Self {
        Self::server_key(&request.core.via, request.core.call_id.as_str(), request)
    }

    /// Key of the INVITE server transaction a CANCEL targets: same
    /// branch and sent-by, method INVITE (RFC 3261 §9.2).
    pub fn cancel_target(request: &IncomingRequest) -> Self {
        let via = &request.core.via;
        match via.branch_arc() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => {
                TsxKey::Rfc3261(Rfc3261Key::Server {
                    branch,
                    sent_by: via.sent_by().clone(),
                    method: SipMethod::Invite,
                })
            }
            _ => TsxKey::Rfc2543(Box::new(Rfc2543Key {
                cseq: request.core.cseq.cseq,
                from_tag: request.core.from.tag().map(Arc::from),
                call_id: Arc::from(request.core.call_id.as_str()),
                via_sent_by: via.sent_by().clone(),
                method: SipMethod::Invite,
            })),
        }
    }

    fn server_key(via: &Via, call_id: &str, request: &IncomingRequest) -> Self {
        let method = normalize(request.method());
        match via.branch_arc() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => {
                TsxKey::Rfc3261(Rfc3261Key::Server {
                    branch,
                    sent_by: via.sent_by().clone(),
                    method,
                })
            }
            _ => TsxKey::Rfc2543(Box::new(Rfc2543Key {
                cseq: request.core.cseq.cseq,
                from_tag: request.core.from.tag().map(Arc::from),
                call_id: Arc::from(call_id),
                via_sent_by: via.sent_by().clone(),
                method,
            })),
        }
    }

    /// The branch of the key, when it has one.
    pub fn branch(&self) -> Option<&str> {
        match self {
            TsxKey::Rfc3261(Rfc3261Key::Client { branch, .. }) => Some(branch),
            TsxKey::Rfc3261(Rfc3261Key::Server { branch, .. }) => Some(branch),
            TsxKey::Rfc2543(_) => None,
        }
    }

    pub fn method(&self) -> &SipMethod {
        match self {
            TsxKey::Rfc3261(Rfc3261Key::Client { method, .. }) => method,
            TsxKey::Rfc3261(Rfc3261Key::Server { method, .. }) => method,
            TsxKey::Rfc2543(key) => &key.method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mock;

    #[test]
    fn test_ack_matches_invite_server_key() {
        let invite = mock::request(SipMethod::Invite);
        let ack = mock::request(SipMethod::Ack);

        assert_eq!(TsxKey::create_server(&invite), TsxKey::create_server(&ack));
    }

    #[test]
    fn test_cancel_is_its_own_transaction() {
        let invite = mock::request(SipMethod::Invite);
        let cancel = mock::request(SipMethod::Cancel);

        assert_ne!(TsxKey::create_server(&invite), TsxKey::create_server(&cancel));
        assert_eq!(TsxKey::cancel_target(&cancel), TsxKey::create_server(&invite));
    }

    #[test]
    fn test_legacy_branch_falls_back() {
        let mut request = mock::request(SipMethod::Options);
        request.core.via = crate::headers::HeaderParse::from_bytes(
            b"SIP/2.0/UDP host.example.com:5060;branch=1",
        )
        .unwrap();

        assert_matches!(TsxKey::create_server(&request), TsxKey::Rfc2543(_));
    }
}
