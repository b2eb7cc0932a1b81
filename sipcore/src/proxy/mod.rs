//! Stateful and stateless proxying (RFC 3261 §16).
//!
//! The functions here prepare requests for forwarding (Max-Forwards,
//! Via, Record-Route, loose routing) and detect loops; the fork state
//! machine lives in [`fork`]. The call process wires both to its
//! transactions.

mod fork;

pub use fork::{Fork, ForkAction, ForkBranch, ForkMode};

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::headers::{
    ContactAddr, Header, MaxForwards, Path, RecordRoute, Via, BRANCH_MAGIC_COOKIE,
};
use crate::message::{HostPort, Request, Response, SipAddr, SipMethod, StatusCode, TransportKind, Uri};
use crate::router::{ProxyOpts, SipReply};
use crate::transport::IncomingRequest;

/// The identity this proxy writes into Via/Record-Route/Contact.
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub host_port: HostPort,
    pub kind: TransportKind,
}

/// The loop-detection fingerprint of a request: a stable hash of the
/// fields that determine how this proxy routes it. Embedded in every
/// branch this proxy generates.
pub(crate) fn fingerprint(request: &IncomingRequest) -> String {
    let mut hasher = DefaultHasher::new();
    request.request.uri().to_string().hash(&mut hasher);
    request.core.from.tag().hash(&mut hasher);
    request.core.to.tag().hash(&mut hasher);
    request.core.call_id.as_str().hash(&mut hasher);
    request.core.cseq.cseq.hash(&mut hasher);
    request.core.cseq.method().as_str().hash(&mut hasher);
    for header in request.request.headers.iter() {
        if let Header::ProxyRequire(pr) = header {
            for tag in pr.tags() {
                tag.hash(&mut hasher);
            }
        }
    }
    format!("{:016x}", hasher.finish())
}

/// A fresh branch carrying the fingerprint:
/// `z9hG4bK<fingerprint>.<random>`.
pub(crate) fn fresh_branch(fingerprint: &str) -> Arc<str> {
    let nonce: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{BRANCH_MAGIC_COOKIE}{fingerprint}.{nonce}").into()
}

/// Checks the request's Via chain for a branch carrying this proxy's
/// fingerprint of the same request (RFC 3261 §16.3 item 4). A match
/// means the request visited us before without being re-targeted.
pub(crate) fn is_loop(request: &IncomingRequest, fingerprint: &str) -> bool {
    request.request.headers.vias().any(|via| {
        via.branch().is_some_and(|branch| {
            branch
                .strip_prefix(BRANCH_MAGIC_COOKIE)
                .is_some_and(|rest| rest.starts_with(fingerprint))
        })
    })
}

/// Pre-forwarding validation: Max-Forwards exhaustion and loops.
pub(crate) fn validate(request: &IncomingRequest) -> Result<(), SipReply> {
    let hops = request
        .request
        .headers
        .max_forwards()
        .copied()
        .unwrap_or_default();
    if hops.is_exhausted() {
        return Err(SipReply::new(StatusCode::TooManyHops));
    }

    if is_loop(request, &fingerprint(request)) {
        return Err(SipReply::new(StatusCode::LoopDetected));
    }

    Ok(())
}

/// Builds the request to send on one branch: options applied,
/// Max-Forwards decremented, loose routing rewritten, and a fresh Via
/// on top (RFC 3261 §16.6).
pub(crate) fn prepare_branch(
    request: &IncomingRequest,
    target: &Uri,
    opts: &ProxyOpts,
    local: &LocalInfo,
    branch: Arc<str>,
) -> Request {
    let mut msg = request.request.clone();

    if opts.remove_routes {
        msg.headers.retain(|h| !matches!(h, Header::Route(_)));
    }

    msg.req_line.uri = target.clone();

    // Max-Forwards: decrement, or start one below the default.
    match msg.headers.max_forwards_mut() {
        Some(hops) => hops.decrement(),
        None => {
            let mut hops = MaxForwards::default();
            hops.decrement();
            msg.headers.push(Header::MaxForwards(hops));
        }
    }
    if let Some(hops) = opts.max_forwards_override {
        if let Some(max_forwards) = msg.headers.max_forwards_mut() {
            *max_forwards = MaxForwards::new(hops);
        }
    }

    // Route processing (RFC 3261 §16.6 / §16.12).
    let top_route = msg.headers.routes().next().cloned();
    if let Some(top_route) = top_route {
        if host_is_local(top_route.uri(), local) {
            // The topmost route names us; our job is done.
            msg.headers.pop_route();
        } else if !top_route.is_loose() {
            // Strict-routing peer: it expects the route in the R-URI
            // and the original target at the end of the route set.
            msg.headers.pop_route();
            let original = std::mem::replace(&mut msg.req_line.uri, top_route.uri().clone());
            msg.headers
                .push(Header::Route(crate::headers::Route::new(original)));
        }
    }

    for (name, value) in &opts.insert_headers {
        msg.headers.push(Header::Other {
            name: name.clone(),
            value: value.clone(),
        });
    }

    if opts.record_route {
        let mut uri = Uri::new(local.host_port.host.clone(), local.host_port.port);
        uri.lr_param = true;
        msg.headers.insert(0, Header::RecordRoute(RecordRoute::new(uri)));
    }

    if opts.path && msg.req_line.method == SipMethod::Register {
        let mut uri = Uri::new(local.host_port.host.clone(), local.host_port.port);
        uri.lr_param = true;
        msg.headers.insert(0, Header::Path(Path::new(uri)));
    }

    if opts.add_contact {
        let uri = Uri::new(local.host_port.host.clone(), local.host_port.port);
        msg.headers
            .push(Header::Contact(ContactAddr::new(SipAddr::Uri(uri)).into()));
    }

    let via = Via::new(local.kind, local.host_port.clone(), branch);
    msg.headers.insert(0, Header::Via(via));

    msg
}

/// The URI the prepared request is actually sent to: the topmost
/// loose route when one remains, else the Request-URI.
pub(crate) fn next_hop(msg: &Request) -> &Uri {
    match msg.headers.routes().next() {
        Some(route) if route.is_loose() => route.uri(),
        _ => msg.uri(),
    }
}

/// Strips this proxy's Via from a branch response so it can travel
/// upstream (RFC 3261 §16.7 item 9).
pub(crate) fn upstream_response(mut response: Response) -> Response {
    response.headers.pop_via();
    response
}

/// Pops the topmost Via of a response relayed statelessly and returns
/// the Via now on top, which names the next hop.
pub(crate) fn stateless_response(response: &mut Response) -> Option<Via> {
    response.headers.pop_via();
    response.headers.via().cloned()
}

fn host_is_local(uri: &Uri, local: &LocalInfo) -> bool {
    uri.host_port.host.matches(&local.host_port.host)
        && uri.host_port.port.unwrap_or_else(|| local.kind.default_port())
            == local.host_port.port.unwrap_or_else(|| local.kind.default_port())
}

/// A CANCEL-or-reject guard: only INVITE forks are cancellable.
pub(crate) fn fork_mode_for(opts: &ProxyOpts, targets: &[Uri]) -> ForkMode {
    if opts.follow_redirects || targets.len() == 1 {
        ForkMode::Serial
    } else {
        ForkMode::Parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderParse;
    use crate::transaction::mock;

    fn local() -> LocalInfo {
        LocalInfo {
            host_port: HostPort {
                host: crate::message::Host::DomainName("proxy.example.com".into()),
                port: Some(5060),
            },
            kind: TransportKind::Udp,
        }
    }

    #[test]
    fn test_prepare_decrements_max_forwards() {
        let mut request = mock::request(SipMethod::Invite);
        request
            .request
            .headers
            .push(Header::MaxForwards(MaxForwards::new(70)));

        let target: Uri = "sip:bob@192.0.2.4".parse().unwrap();
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(&request, &target, &ProxyOpts::default(), &local(), branch);

        assert_eq!(prepared.headers.max_forwards().unwrap().get(), 69);
        assert_eq!(prepared.uri().to_string(), "sip:bob@192.0.2.4");
    }

    #[test]
    fn test_prepare_adds_via_on_top() {
        let request = mock::request(SipMethod::Invite);
        let target: Uri = "sip:bob@192.0.2.4".parse().unwrap();
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(
            &request,
            &target,
            &ProxyOpts::default(),
            &local(),
            branch.clone(),
        );

        let vias: Vec<_> = prepared.headers.vias().collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[0].branch(), Some(&*branch));
        assert_eq!(vias[0].sent_by().host.to_string(), "proxy.example.com");
    }

    #[test]
    fn test_record_route_inserts_loose_uri() {
        let request = mock::request(SipMethod::Invite);
        let target: Uri = "sip:bob@192.0.2.4".parse().unwrap();
        let opts = ProxyOpts {
            record_route: true,
            ..Default::default()
        };
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(&request, &target, &opts, &local(), branch);

        let rr = prepared.headers.record_routes().next().unwrap();
        assert!(rr.uri().lr_param);
        assert_eq!(rr.uri().host_port.host.to_string(), "proxy.example.com");
    }

    #[test]
    fn test_loop_detected_on_own_branch() {
        let mut request = mock::request(SipMethod::Invite);
        let fp = fingerprint(&request);

        // Simulate the request coming back with our branch in the
        // chain.
        let our_via = Via::new(
            TransportKind::Udp,
            local().host_port,
            fresh_branch(&fp),
        );
        request.request.headers.insert(0, Header::Via(our_via));

        assert!(is_loop(&request, &fp));
        assert_matches!(validate(&request), Err(reply) if reply.code == StatusCode::LoopDetected);
    }

    #[test]
    fn test_different_target_is_spiral_not_loop() {
        let mut request = mock::request(SipMethod::Invite);
        let fp = fingerprint(&request);

        let our_via = Via::new(TransportKind::Udp, local().host_port, fresh_branch(&fp));
        request.request.headers.insert(0, Header::Via(our_via));

        // A rewritten Request-URI changes the fingerprint.
        request.request.req_line.uri = "sip:other@elsewhere.example.org".parse().unwrap();
        let new_fp = fingerprint(&request);
        assert!(!is_loop(&request, &new_fp));
    }

    #[test]
    fn test_max_forwards_exhausted_rejected() {
        let mut request = mock::request(SipMethod::Invite);
        request
            .request
            .headers
            .push(Header::MaxForwards(MaxForwards::new(0)));

        assert_matches!(validate(&request), Err(reply) if reply.code == StatusCode::TooManyHops);
    }

    #[test]
    fn test_loose_route_left_in_place() {
        let mut request = mock::request(SipMethod::Invite);
        request.request.headers.push(Header::Route(
            HeaderParse::from_bytes(b"<sip:p2.example.net;lr>").unwrap(),
        ));

        let target = request.request.uri().clone();
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(&request, &target, &ProxyOpts::default(), &local(), branch);

        // Loose route stays; next hop is the route, not the R-URI.
        assert_eq!(prepared.headers.routes().count(), 1);
        assert_eq!(
            next_hop(&prepared).host_port.host.to_string(),
            "p2.example.net"
        );
    }

    #[test]
    fn test_strict_route_rewrites_request_uri() {
        let mut request = mock::request(SipMethod::Invite);
        request.request.headers.push(Header::Route(
            HeaderParse::from_bytes(b"<sip:strict.example.net>").unwrap(),
        ));

        let target = request.request.uri().clone();
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(&request, &target, &ProxyOpts::default(), &local(), branch);

        assert_eq!(
            prepared.uri().host_port.host.to_string(),
            "strict.example.net"
        );
        // The original target moved to the end of the route set.
        let last_route = prepared.headers.routes().last().unwrap();
        assert_eq!(last_route.uri().to_string(), target.to_string());
    }

    #[test]
    fn test_own_route_is_popped() {
        let mut request = mock::request(SipMethod::Invite);
        request.request.headers.push(Header::Route(
            HeaderParse::from_bytes(b"<sip:proxy.example.com;lr>").unwrap(),
        ));

        let target = request.request.uri().clone();
        let branch = fresh_branch(&fingerprint(&request));
        let prepared = prepare_branch(&request, &target, &ProxyOpts::default(), &local(), branch);

        assert_eq!(prepared.headers.routes().count(), 0);
    }
}
