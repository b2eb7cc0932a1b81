//! SIP endpoint.
//!
//! The endpoint ties the layers together: it receives parsed messages
//! from the transport layer, dispatches them to call processes by
//! Call-ID, and offers the response-building and sending primitives
//! those processes use.

pub mod builder;
mod config;

pub use builder::Builder;
pub use config::Config;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::call::{CallEvent, CallRegistry};
use crate::error::{Error, Result};
use crate::headers::{Header, Headers, Via};
use crate::message::{Host, HostPort, Response, SipMethod, StatusCode, StatusLine, TransportKind, Uri};
use crate::plugin::PluginChain;
use crate::proxy::{self, LocalInfo};
use crate::registrar::Registrar;
use crate::router::{Application, SipReply};
use crate::transaction::TimerConfig;
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, Packet,
    Payload, ToBytes, Transport, TransportLayer,
};

pub(crate) struct Inner {
    /// The transport layer for the endpoint.
    pub(crate) transport: TransportLayer,
    /// The running call processes.
    pub(crate) calls: CallRegistry,
    /// The registrar, when one was attached.
    pub(crate) registrar: Option<Registrar>,
    /// The application callbacks.
    pub(crate) application: Arc<dyn Application>,
    /// The plugin hook chain.
    pub(crate) plugins: PluginChain,
    /// The endpoint configuration.
    pub(crate) config: Config,
}

/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP
/// messages, dispatch them to per-call processes, and interact with
/// the application, registrar, and plugin ports.
#[derive(Clone)]
pub struct Endpoint(pub(crate) Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Runs the endpoint by processing messages from the transport
    /// layer until the process ends.
    pub async fn run(self) -> Result<()> {
        tracing::debug!(name = %self.0.config.name, "endpoint running");
        tokio::spawn(Box::pin(self.receive_messages()))
            .await
            .map_err(|e| io::Error::other(format!("Task join error: {e}")))??;

        Ok(())
    }

    /// Runs the endpoint for at most `timeout`.
    pub async fn run_with_timeout(self, timeout: Duration) -> Result<()> {
        let _ = tokio::time::timeout(timeout, self.receive_messages()).await;

        Ok(())
    }

    async fn receive_messages(self) -> Result<()> {
        self.0.transport.handle_events(&self).await
    }

    /// Gets the endpoint name.
    pub fn name(&self) -> &str {
        &self.0.config.name
    }

    pub(crate) fn config(&self) -> &Config {
        &self.0.config
    }

    pub(crate) fn timers(&self) -> TimerConfig {
        self.0.config.timers
    }

    pub(crate) fn calls(&self) -> &CallRegistry {
        &self.0.calls
    }

    pub(crate) fn transport(&self) -> &TransportLayer {
        &self.0.transport
    }

    /// The registrar, when one was attached at build time.
    pub fn registrar(&self) -> Option<&Registrar> {
        self.0.registrar.as_ref()
    }

    pub(crate) fn application(&self) -> &Arc<dyn Application> {
        &self.0.application
    }

    pub(crate) fn plugins(&self) -> &PluginChain {
        &self.0.plugins
    }

    /// Routes an incoming request to its call process, spawning one
    /// when the Call-ID is new.
    pub(crate) async fn process_request(&self, request: IncomingRequest) -> Result<()> {
        if self.0.config.debug {
            tracing::trace!(
                method = %request.method(),
                call_id = %request.core.call_id.as_str(),
                from = %request.packet.addr,
                "dispatching request",
            );
        }
        let call = self
            .0
            .calls
            .find_or_spawn(&request.core.call_id, self);
        call.send(CallEvent::Request(Box::new(request))).await
    }

    /// Routes an incoming response to its call process. Responses for
    /// unknown calls are relayed statelessly when our Via is on top,
    /// dropped otherwise.
    pub(crate) async fn process_response(&self, response: IncomingResponse) -> Result<()> {
        if let Some(call) = self.0.calls.find(&response.core.call_id) {
            return call.send(CallEvent::Response(Box::new(response))).await;
        }

        self.relay_stateless_response(response).await
    }

    /// Stateless response relay: pop our Via, send to the next one
    /// (RFC 3261 §16.11).
    async fn relay_stateless_response(&self, mut response: IncomingResponse) -> Result<()> {
        let local = self.local_info(response.transport.kind());
        let ours = response
            .response
            .headers
            .via()
            .is_some_and(|via| via.sent_by().host.matches(&local.host_port.host));

        if !ours {
            log::debug!(
                "Dropping response ({}) with no matching call",
                response.code().into_u16(),
            );
            return Ok(());
        }

        let Some(next) = proxy::stateless_response(&mut response.response) else {
            log::debug!("Response has no Via left after ours, dropping");
            return Ok(());
        };

        let addr = self.get_outbound_addr(&next, &response.transport);
        let mut outgoing = OutgoingResponse {
            response: response.response,
            addr,
            buf: None,
        };
        self.send_response(&mut outgoing).await
    }

    /// Respond statelessly to a request.
    ///
    /// The response is built from the request and sent without
    /// creating any server transaction state.
    pub async fn respond_stateless(&self, request: &IncomingRequest, reply: SipReply) -> Result<()> {
        let mut response = self.reply_response(request, reply);
        self.send_response(&mut response).await
    }

    /// Builds a request to send as UAC: fresh branch, Call-ID, and the
    /// configured From.
    pub fn new_request(&self, method: SipMethod, target: Uri) -> Result<OutgoingRequest> {
        use crate::headers::{CSeq, CallId, From as FromHdr, Header, MaxForwards, To};
        use crate::message::{Request, SipAddr};

        let kind = target.transport();
        let local = self.local_info(kind);
        let branch: Arc<str> = format!(
            "{}{}",
            crate::headers::BRANCH_MAGIC_COOKIE,
            uuid::Uuid::new_v4().simple(),
        )
        .into();

        let from_addr = match &self.0.config.from {
            Some(from) => from.clone(),
            None => {
                let mut uri = Uri::new(local.host_port.host.clone(), local.host_port.port);
                uri.user = Some(crate::message::UserInfo::new("sipcore"));
                SipAddr::Uri(uri)
            }
        };
        let mut from = FromHdr::new(from_addr);
        from.set_tag(uuid::Uuid::new_v4().simple().to_string());

        let mut headers = Headers::with_capacity(6);
        headers.push(Header::Via(Via::new(kind, local.host_port.clone(), branch)));
        headers.push(Header::MaxForwards(MaxForwards::default()));
        headers.push(Header::From(from));
        headers.push(Header::To(To::new(SipAddr::Uri(target.clone()))));
        headers.push(Header::CallId(CallId::generate()));
        headers.push(Header::CSeq(CSeq::new(1, method.clone())));

        let (addr, transport) = self.resolve_target(&target)?;

        Ok(OutgoingRequest {
            msg: Request {
                req_line: crate::message::RequestLine { method, uri: target },
                headers,
                body: None,
            },
            addr,
            buf: None,
            transport,
        })
    }

    /// Sends a locally originated request as UAC. Its responses are
    /// delivered to [`Application::on_response`].
    pub async fn send_request(&self, mut request: OutgoingRequest) -> Result<()> {
        // The plugin chain may add headers to every outbound request.
        let mut extra = match self.0.plugins.transport_uac_headers(Headers::new()).await {
            crate::plugin::HookOutcome::Continue(extra) => extra,
            crate::plugin::HookOutcome::ShortCircuit(_) => Headers::new(),
        };
        request.msg.headers.append(&mut extra);

        let call_id = request
            .msg
            .headers
            .call_id()
            .cloned()
            .ok_or(Error::MissingRequiredHeader("Call-ID"))?;

        let call = self.0.calls.find_or_spawn(&call_id, self);
        call.send(CallEvent::Send(Box::new(request))).await
    }

    /// Terminates every call process: pending INVITE servers answer
    /// 487 and branches are cancelled.
    pub async fn shutdown(&self) {
        self.0.calls.terminate_all().await;
    }

    /// Creates a response for an incoming request, copying the Via
    /// chain, Record-Routes, Call-ID, From, To, and CSeq per RFC 3261
    /// §8.2.6.2, adding a To tag on non-100 responses.
    pub fn new_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<&str>,
    ) -> OutgoingResponse {
        let mut headers = Headers::with_capacity(7);
        let msg_headers = &request.request.headers;

        // Via chain, topmost first, with the stamped origin.
        headers.push(Header::Via(request.core.via.clone()));
        headers.extend(
            msg_headers
                .vias()
                .skip(1)
                .cloned()
                .map(Header::Via),
        );

        // Record-Route echoes.
        headers.extend(
            msg_headers
                .record_routes()
                .cloned()
                .map(Header::RecordRoute),
        );

        headers.push(Header::CallId(request.core.call_id.clone()));
        headers.push(Header::From(request.core.from.clone()));

        let mut to = request.core.to.clone();
        // 8.2.6.2: the UAS adds a To tag in every non-100 response.
        // Deriving it from the branch keeps retransmissions identical.
        if to.tag().is_none() && code != StatusCode::Trying {
            if let Some(branch) = request.core.via.branch() {
                let tag = branch.strip_prefix("z9hG4bK").unwrap_or(branch);
                to.set_tag(tag.to_string());
            }
        }
        headers.push(Header::To(to));
        headers.push(Header::CSeq(request.core.cseq.clone()));

        let addr = self.get_outbound_addr(&request.core.via, &request.transport);
        let reason: Arc<str> = match reason {
            Some(reason) => reason.into(),
            None => code.reason().into(),
        };

        OutgoingResponse {
            response: Response {
                status_line: StatusLine { code, reason },
                headers,
                body: None,
            },
            addr,
            buf: None,
        }
    }

    /// Builds the response for an application [`SipReply`].
    pub(crate) fn reply_response(
        &self,
        request: &IncomingRequest,
        reply: SipReply,
    ) -> OutgoingResponse {
        let reason = reply.reason.as_deref().map(str::to_string);
        let mut response = self.new_response(request, reply.code, reason.as_deref());
        let mut extra = reply.headers;
        response.append_headers(&mut extra);
        if let Some(body) = reply.body {
            response.set_body(body);
        }
        response
    }

    /// Wraps a proxied response for the upstream hop of `request`.
    pub(crate) fn forwarded_response(
        &self,
        request: &IncomingRequest,
        response: Response,
    ) -> OutgoingResponse {
        let addr = self.get_outbound_addr(&request.core.via, &request.transport);
        OutgoingResponse {
            response,
            addr,
            buf: None,
        }
    }

    /// Serializes and sends a response to its destination.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        log::debug!(
            "=> Response {} {}",
            response.status_code().into_u16(),
            response.reason()
        );
        let encoded = match response.buf.take() {
            Some(buf) => buf,
            None => response.to_bytes()?,
        };

        let sent_to = match &response.addr {
            OutgoingAddr::HostPort { host: HostPort { host, port }, kind } => {
                let ip = self.resolve_host_to_ip(host)?;
                let port = port.unwrap_or_else(|| kind.default_port());
                let addr = SocketAddr::new(ip, port);

                let transport = self
                    .0
                    .transport
                    .find(addr, *kind)
                    .ok_or_else(|| Error::TransportNotFound(format!("{ip}:{port} {kind}")))?;
                transport.send(&encoded, &addr).await?;
                addr
            }
            OutgoingAddr::Addr { addr, transport } => {
                transport.send(&encoded, addr).await?;
                *addr
            }
        };

        let packet = Packet {
            payload: Payload::new(encoded),
            addr: sent_to,
            time: std::time::SystemTime::now(),
        };
        let _ = self.0.plugins.connection_sent(&packet).await;

        Ok(())
    }

    /// Resolves a branch target to a concrete address and transport.
    /// Name resolution beyond literal IPs belongs to the transport
    /// collaborator.
    pub(crate) fn resolve_target(&self, uri: &Uri) -> Result<(SocketAddr, Arc<dyn Transport>)> {
        let kind = uri.transport();
        let ip = self.resolve_host_to_ip(&uri.host_port.host)?;
        let addr = SocketAddr::new(ip, uri.port_or_default());

        let transport = self
            .0
            .transport
            .find(addr, kind)
            .ok_or_else(|| Error::TransportNotFound(format!("{addr} {kind}")))?;

        Ok((addr, transport))
    }

    fn resolve_host_to_ip(&self, host: &Host) -> Result<IpAddr> {
        match host {
            Host::IpAddr(ip) => Ok(*ip),
            Host::DomainName(name) if name.eq_ignore_ascii_case("localhost") => {
                Ok(IpAddr::from([127, 0, 0, 1]))
            }
            Host::DomainName(name) => Err(Error::TransportNotFound(format!(
                "DNS resolution for {name} is delegated to the transport"
            ))),
        }
    }

    /// The identity written into Via/Record-Route/Contact for `kind`.
    pub(crate) fn local_info(&self, kind: TransportKind) -> LocalInfo {
        let host_port = match &self.0.config.local_host {
            Some(host) => {
                let host = match host.parse::<IpAddr>() {
                    Ok(ip) => Host::IpAddr(ip),
                    Err(_) => Host::DomainName(host.as_str().into()),
                };
                HostPort::new(host, None)
            }
            None => {
                let bound = self
                    .0
                    .config
                    .listen
                    .iter()
                    .find(|(_, k)| *k == kind)
                    .map(|(addr, _)| *addr);
                match bound {
                    Some(addr) => HostPort::from(addr),
                    None => HostPort::new(Host::IpAddr(IpAddr::from([127, 0, 0, 1])), Some(kind.default_port())),
                }
            }
        };

        LocalInfo { host_port, kind }
    }

    // RFC 3261 §18.2.2 and RFC 3581: where a response to this Via
    // must be sent.
    pub(crate) fn get_outbound_addr(
        &self,
        via: &Via,
        transport: &Arc<dyn Transport>,
    ) -> OutgoingAddr {
        if transport.reliable() {
            // The response travels back on the same connection.
            return OutgoingAddr::Addr {
                addr: transport.addr(),
                transport: transport.clone(),
            };
        }

        if let Some(maddr) = via.maddr() {
            let port = via.sent_by().port.unwrap_or(5060);
            return OutgoingAddr::HostPort {
                host: HostPort {
                    host: maddr.clone(),
                    port: Some(port),
                },
                kind: via.transport(),
            };
        }

        if let (Some(rport), Some(received)) = (via.rport(), via.received()) {
            return OutgoingAddr::Addr {
                addr: SocketAddr::new(received, rport),
                transport: transport.clone(),
            };
        }

        if let Some(received) = via.received() {
            let port = via.sent_by().port.unwrap_or(5060);
            return OutgoingAddr::Addr {
                addr: SocketAddr::new(received, port),
                transport: transport.clone(),
            };
        }

        OutgoingAddr::HostPort {
            host: via.sent_by().clone(),
            kind: via.transport(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use crate::transaction::mock;

    async fn endpoint() -> Endpoint {
        Builder::new().with_name("test").build().await
    }

    #[tokio::test]
    async fn test_new_response_copies_core_headers() {
        let endpoint = endpoint().await;
        let request = mock::request(SipMethod::Invite);

        let response = endpoint.new_response(&request, StatusCode::Ringing, None);

        assert_eq!(response.status_code(), StatusCode::Ringing);
        assert_eq!(response.reason(), "Ringing");
        let headers = &response.response.headers;
        assert!(headers.via().is_some());
        assert!(headers.call_id().is_some());
        assert_eq!(headers.cseq().unwrap(), &request.core.cseq);
        // A To tag was added.
        assert!(headers.to_hdr().unwrap().tag().is_some());
    }

    #[tokio::test]
    async fn test_to_tag_stable_across_retransmissions() {
        let endpoint = endpoint().await;
        let request = mock::request(SipMethod::Invite);

        let a = endpoint.new_response(&request, StatusCode::Ok, None);
        let b = endpoint.new_response(&request, StatusCode::Ok, None);

        assert_eq!(
            a.response.headers.to_hdr().unwrap().tag(),
            b.response.headers.to_hdr().unwrap().tag(),
        );
    }

    #[tokio::test]
    async fn test_100_has_no_to_tag() {
        let endpoint = endpoint().await;
        let request = mock::request(SipMethod::Invite);

        let response = endpoint.new_response(&request, StatusCode::Trying, None);
        assert!(response.response.headers.to_hdr().unwrap().tag().is_none());
    }

    #[tokio::test]
    async fn test_outbound_addr_prefers_rport() {
        let endpoint = endpoint().await;
        let request = {
            let mut request = mock::request(SipMethod::Options);
            request.core.via = crate::headers::HeaderParse::from_bytes(
                b"SIP/2.0/UDP client.example.com;rport;branch=z9hG4bK77",
            )
            .unwrap();
            request.core.via.stamp_origin("203.0.113.7:16384".parse().unwrap());
            request
        };

        let addr = endpoint.get_outbound_addr(&request.core.via, &request.transport);
        let OutgoingAddr::Addr { addr, .. } = addr else {
            panic!("expected concrete address");
        };
        assert_eq!(addr, "203.0.113.7:16384".parse().unwrap());
    }

    #[tokio::test]
    async fn test_reply_response_appends_headers_and_body(){
        let endpoint = endpoint().await;
        let request = mock::request(SipMethod::Message);

        let reply = SipReply::new(StatusCode::Ok)
            .with_header(Header::Other {
                name: "X-Info".into(),
                value: "checked".into(),
            });
        let response = endpoint.reply_response(&request, reply);

        assert_eq!(
            response.response.headers.raw_values("X-Info").next(),
            Some("checked")
        );
    }
}
