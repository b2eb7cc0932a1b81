//! SIP transport layer.
//!
//! Socket plumbing itself is an external collaborator: the core talks
//! to anything implementing [`Transport`]. The [`TransportLayer`] owns
//! the connection table and the inbound event channel, turns packets
//! into typed incoming messages, and applies the malformed-message
//! policy (canned 400 on streams, silent drop on datagrams).

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::headers::{CSeq, CallId, ContentLength, From as FromHdr, Header, HeaderParse, Headers, To, Via};
use crate::message::{HostPort, Request, Response, SipMethod, SipMsg, StatusCode, TransportKind};
use crate::parser::{decode, ParseOutcome};

pub mod udp;

/// An abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (e.g. UDP, TCP, TLS).
    fn kind(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Checks if the provided address belongs to the same IP address
    /// family (IPv4 vs IPv6) as the local socket address.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.addr();
        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// Returns the local transport name used in Via/Contact.
    fn local_name(&self) -> Cow<'_, str>;

    /// Returns `true` if the transport is reliable (e.g. TCP or TLS).
    fn reliable(&self) -> bool {
        self.kind().is_reliable()
    }

    /// Returns `true` if the transport is secure (e.g. TLS).
    fn secure(&self) -> bool {
        self.kind().is_secure()
    }

    /// Returns the key that uniquely identifies this transport.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.kind())
    }
}

/// A key identifying a transport connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    addr: SocketAddr,
    kind: TransportKind,
}

impl TransportKey {
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        TransportKey { addr, kind }
    }
}

/// A factory for creating SIP transports.
///
/// Used by connection-oriented transports like TCP and TLS.
#[async_trait::async_trait]
pub trait Factory: Sync + Send {
    /// Creates a new transport instance connected to `addr`.
    async fn create(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>>;

    /// Returns the transport kind this factory creates.
    fn kind(&self) -> TransportKind;
}

/// The raw binary content of a packet or body.
#[derive(Clone)]
pub struct Payload(pub(crate) Bytes);

impl Payload {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// A raw packet as delivered by a transport.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Where an outbound response goes.
pub enum OutgoingAddr {
    /// A host/port to resolve and look a transport up for.
    HostPort {
        host: HostPort,
        kind: TransportKind,
    },
    /// A concrete address on an existing transport.
    Addr {
        addr: SocketAddr,
        transport: Arc<dyn Transport>,
    },
}

/// Conversion into wire bytes.
pub trait ToBytes: Sized {
    fn to_bytes(&self) -> Result<Bytes>;
}

fn write_msg(
    buf: &mut impl Write,
    headers: &Headers,
    body: Option<&Bytes>,
) -> std::io::Result<()> {
    // Content-Length is computed from the body on the way out.
    for header in headers.iter() {
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf, "{header}\r\n")?;
    }
    let body_len = body.map(|b| b.len()).unwrap_or(0);
    write!(buf, "{}: {}\r\n\r\n", ContentLength::NAME, body_len)?;
    if let Some(body) = body {
        buf.write_all(body)?;
    }
    Ok(())
}

/// An outbound SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The serialized form, cached between retransmissions.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.response.headers
    }

    /// Appends headers, draining `other`.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.response.headers.append(other);
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.response.body = Some(body);
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated = if self.response.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated);
        let mut writer = buf.writer();

        write!(writer, "{}", &self.response.status_line)?;
        write_msg(&mut writer, &self.response.headers, self.response.body.as_ref())?;

        Ok(writer.into_inner().freeze())
    }
}

/// An outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The address to send the request to.
    pub addr: SocketAddr,
    /// The serialized form, cached between retransmissions.
    pub buf: Option<Bytes>,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated = if self.msg.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated);
        let mut writer = buf.writer();

        write!(writer, "{}", &self.msg.req_line)?;
        write_msg(&mut writer, &self.msg.headers, self.msg.body.as_ref())?;

        Ok(writer.into_inner().freeze())
    }
}

/// The mandatory core headers, extracted once per incoming message.
#[derive(Clone)]
pub struct CoreHeaders {
    /// The topmost Via header, origin already stamped.
    pub via: Via,
    /// The From header.
    pub from: FromHdr,
    /// The To header.
    pub to: To,
    /// The CSeq header.
    pub cseq: CSeq,
    /// The Call-ID header.
    pub call_id: CallId,
}

impl CoreHeaders {
    /// Pulls the core headers out of a validated message.
    pub(crate) fn extract(msg: &SipMsg) -> Result<Self> {
        let headers = msg.headers();
        let via = headers.via().cloned().ok_or(Error::MissingRequiredHeader(Via::NAME))?;
        let from = headers
            .from_hdr()
            .cloned()
            .ok_or(Error::MissingRequiredHeader(FromHdr::NAME))?;
        let to = headers.to_hdr().cloned().ok_or(Error::MissingRequiredHeader(To::NAME))?;
        let cseq = headers.cseq().cloned().ok_or(Error::MissingRequiredHeader(CSeq::NAME))?;
        let call_id = headers
            .call_id()
            .cloned()
            .ok_or(Error::MissingRequiredHeader(CallId::NAME))?;

        Ok(CoreHeaders {
            via,
            from,
            to,
            cseq,
            call_id,
        })
    }
}

/// A received SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub request: Request,
    /// The transport that received the request.
    pub transport: Arc<dyn Transport>,
    /// The packet the request arrived in.
    pub packet: Packet,
    /// The core headers extracted from the request.
    pub core: CoreHeaders,
}

impl IncomingRequest {
    pub fn method(&self) -> &SipMethod {
        self.request.method()
    }

    #[inline(always)]
    pub fn is_method(&self, method: &SipMethod) -> bool {
        self.request.method() == method
    }

    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    pub fn call_id(&self) -> &CallId {
        &self.core.call_id
    }

    pub fn from(&self) -> &FromHdr {
        &self.core.from
    }

    pub fn to(&self) -> &To {
        &self.core.to
    }

    pub fn via(&self) -> &Via {
        &self.core.via
    }

    pub fn cseq(&self) -> &CSeq {
        &self.core.cseq
    }
}

/// A received SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The transport that received the response.
    pub transport: Arc<dyn Transport>,
    /// The packet the response arrived in.
    pub packet: Packet,
    /// The core headers extracted from the response.
    pub core: CoreHeaders,
}

impl IncomingResponse {
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }

    pub fn call_id(&self) -> &CallId {
        &self.core.call_id
    }

    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }
}

/// Events posted by transports to the layer.
pub(crate) enum TransportEvent {
    /// A packet was received.
    Packet {
        transport: Arc<dyn Transport>,
        packet: Packet,
    },
    /// A new transport was created.
    Created(Arc<dyn Transport>),
    /// A transport was closed.
    Closed(TransportKey),
    /// A factory was registered.
    Factory(Box<dyn Factory>),
}

pub(crate) type TransportTx = mpsc::Sender<TransportEvent>;
type TransportRx = mpsc::Receiver<TransportEvent>;

/// The transport layer: connection table plus inbound event channel.
pub struct TransportLayer {
    transports: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
    factories: Mutex<Vec<Box<dyn Factory>>>,
    transport_tx: TransportTx,
    transport_rx: Mutex<Option<TransportRx>>,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLayer {
    pub(crate) fn new() -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(1_000);
        let transport_rx = Mutex::new(Some(transport_rx));

        Self {
            transport_tx,
            transport_rx,
            transports: Default::default(),
            factories: Default::default(),
        }
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.lock().expect("Lock failed").len()
    }

    pub(crate) fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .expect("Lock failed")
            .insert(transport.key(), transport);
    }

    pub(crate) fn remove_transport(&self, key: TransportKey) -> Option<Arc<dyn Transport>> {
        self.transports.lock().expect("Lock failed").remove(&key)
    }

    pub(crate) fn add_factory(&self, factory: Box<dyn Factory>) {
        self.factories.lock().expect("Lock failed").push(factory);
    }

    pub(crate) fn sender(&self) -> &TransportTx {
        &self.transport_tx
    }

    /// Finds a suitable transport for the given destination and kind.
    pub fn find(&self, dst: SocketAddr, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        log::debug!("Finding suitable transport={kind} for={dst}");

        let transports = self.transports.lock().expect("Lock failed");

        // Exact match on the remote address first.
        let key = TransportKey::new(dst, kind);
        if let Some(transport) = transports.get(&key) {
            return Some(transport.clone());
        }

        // Otherwise any transport of the right kind and address family.
        transports
            .values()
            .filter(|handle| handle.kind() == kind && handle.is_same_af(&dst))
            .min_by(|a, b| Arc::strong_count(a).cmp(&Arc::strong_count(b)))
            .cloned()
    }

    pub(crate) async fn handle_events(&self, endpoint: &Endpoint) -> Result<()> {
        let mut rx = self
            .transport_rx
            .lock()
            .expect("Lock failed")
            .take()
            .ok_or(Error::ChannelClosed)?;

        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Packet { transport, packet } => {
                    tokio::spawn(Self::on_received_packet(transport, packet, endpoint.clone()));
                }
                TransportEvent::Created(transport) => {
                    self.add_transport(transport);
                }
                TransportEvent::Closed(key) => {
                    self.remove_transport(key);
                }
                TransportEvent::Factory(factory) => {
                    self.add_factory(factory);
                }
            }
        }

        Ok(())
    }

    pub(crate) async fn on_received_packet(
        transport: Arc<dyn Transport>,
        packet: Packet,
        endpoint: Endpoint,
    ) -> Result<()> {
        let payload = packet.payload.clone();
        let bytes = payload.buf();

        // Keep-alive ping: answer pong (RFC 5626 §4.4.1).
        if bytes == b"\r\n\r\n" {
            transport.send(b"\r\n", &packet.addr).await?;
            return Ok(());
        } else if bytes == b"\r\n" {
            // Keep-alive pong, nothing to do.
            return Ok(());
        }

        // A connection hook may swallow the packet entirely.
        if let crate::plugin::HookOutcome::ShortCircuit(_) =
            endpoint.plugins().connection_recv(&packet).await
        {
            log::debug!("Packet from {} swallowed by a plugin", packet.addr);
            return Ok(());
        }

        let mut msg = match decode(bytes, transport.kind()) {
            ParseOutcome::Complete { msg, .. } => msg,
            ParseOutcome::Partial => {
                // Stream reassembly happens in the connection task; a
                // datagram can never be partial.
                log::debug!("Partial message from {} over {}", packet.addr, transport.kind());
                return Ok(());
            }
            ParseOutcome::ReplyError { reason, reply } => {
                if transport.kind().is_stream() {
                    transport.send(&reply, &packet.addr).await?;
                } else {
                    log::debug!(
                        "Dropping malformed {} bytes from {}: {}",
                        bytes.len(),
                        packet.addr,
                        reason
                    );
                }
                return Err(Error::Parse(reason));
            }
            ParseOutcome::Error(reason) => {
                log::warn!(
                    "Ignoring {} bytes packet from {} {}: {}",
                    bytes.len(),
                    transport.kind(),
                    packet.addr,
                    reason
                );
                return Err(Error::Parse(reason));
            }
        };

        let mut core = CoreHeaders::extract(&msg)?;

        // RFC 3581 §4: record where the request actually came from.
        if msg.is_request() {
            core.via.stamp_origin(packet.addr);
            if let Some(via) = msg.headers_mut().via_mut() {
                via.stamp_origin(packet.addr);
            }
        }

        match msg {
            SipMsg::Request(request) => {
                let request = IncomingRequest {
                    request,
                    transport,
                    packet,
                    core,
                };
                endpoint.process_request(request).await?;
            }
            SipMsg::Response(response) => {
                let response = IncomingResponse {
                    response,
                    transport,
                    packet,
                    core,
                };
                endpoint.process_response(response).await?;
            }
        }

        Ok(())
    }
}

/// A trait to start a new transport.
#[async_trait::async_trait]
pub(crate) trait TransportStartup {
    async fn start(&self, tx: TransportTx) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::mock::MockUdpTransport;

    #[test]
    fn test_add_transport() {
        let transports = TransportLayer::default();
        let addr = "127.0.0.1:8080".parse().unwrap();
        let kind = TransportKind::Udp;

        transports.add_transport(Arc::new(MockUdpTransport::new()));

        assert!(transports.find(addr, kind).is_some());
        assert!(transports.transport_count() == 1);
    }

    #[test]
    fn test_remove_transport() {
        let transports = TransportLayer::default();
        let udp = Arc::new(MockUdpTransport::new());
        let addr = "127.0.0.1:8080".parse().unwrap();
        let kind = TransportKind::Udp;
        let key = udp.key();

        transports.add_transport(udp);
        assert!(transports.find(addr, kind).is_some());

        transports.remove_transport(key);
        assert!(transports.find(addr, kind).is_none());
        assert!(transports.transport_count() == 0);
    }
}
