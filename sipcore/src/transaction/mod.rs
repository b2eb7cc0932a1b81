//! SIP transaction layer.
//!
//! The four RFC 3261 §17 state machines. Every call process owns its
//! own [`TransactionLayer`]; transactions are never shared across
//! calls. FSM transitions are synchronous and atomic; the timer loops
//! run as tasks that only touch their own transaction.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{SipMethod, StatusCode};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport,
};

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
pub(crate) mod key;
pub(crate) mod server;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use key::TsxKey;
pub use server::ServerTransaction;

type LastMsg = tokio::sync::RwLock<Option<Bytes>>;
type LastStatusCode = RwLock<Option<StatusCode>>;

/// The RFC 3261 timer base constants of a transaction, snapshotted at
/// creation. Later configuration changes affect only new transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Estimated round-trip time; baseline for retransmissions.
    pub t1: Duration,
    /// Maximum retransmission interval.
    pub t2: Duration,
    /// Maximum time a message stays in the network; linger baseline.
    pub t4: Duration,
    /// INVITE client transaction timeout (timer B).
    pub tb: Duration,
    /// Proxy INVITE timeout (timer C), used by the fork engine.
    pub tc: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        TimerConfig {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            tb: 64 * t1,
            tc: Duration::from_secs(180),
        }
    }
}

impl TimerConfig {
    /// The `n`-th retransmission interval: `min(2ⁿ·T1, T2)`.
    pub fn retrans_interval(&self, n: u32) -> Duration {
        std::cmp::min(self.t1 * (1 << n.min(16)), self.t2)
    }

    /// Timers F, H, and J: `64·T1`.
    pub fn timeout(&self) -> Duration {
        64 * self.t1
    }

    /// Timer D: absorb INVITE final-response retransmissions.
    pub fn timer_d(&self) -> Duration {
        Duration::from_secs(32)
    }
}

/// Notices a transaction posts to its owning call process.
#[derive(Debug, Clone)]
pub enum TsxEvent {
    /// Timer B/F fired before a final response arrived.
    TimedOut { key: TsxKey },
}

pub(crate) type TsxEventTx = mpsc::Sender<TsxEvent>;

struct Inner {
    /// The role of the transaction (UAC or UAS).
    role: Role,
    /// The layer owning this transaction.
    layer: TransactionLayer,
    /// The key used to identify the transaction.
    key: TsxKey,
    /// The transport used for communication.
    transport: Arc<dyn Transport>,
    /// The address of the remote endpoint.
    addr: SocketAddr,
    /// The current state of the transaction.
    state: Mutex<State>,
    /// The last status code sent or received.
    status_code: LastStatusCode,
    /// The retransmission count.
    retransmit_count: AtomicUsize,
    /// The last message sent, kept for retransmission.
    last_msg: LastMsg,
    /// Timer bases, snapshotted at creation.
    timers: TimerConfig,
    /// Where timeout notices go, when the owner asked for them.
    events: Option<TsxEventTx>,
}

/// The shared core of a SIP transaction.
///
/// A transaction consists of the messages exchanged between a client
/// (UAC) and a server (UAS) to complete one request, such as
/// establishing or terminating a call.
#[derive(Clone)]
pub struct TsxCore(Arc<Inner>);

impl TsxCore {
    fn builder() -> Builder {
        Default::default()
    }

    pub(crate) fn new_uac(
        request: &OutgoingRequest,
        layer: &TransactionLayer,
        state: State,
    ) -> Self {
        let mut builder = Self::builder();

        builder.key(TsxKey::create_client(request));
        builder.role(Role::Uac);
        builder.layer(layer.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.addr);
        builder.state(state);
        builder.timers(layer.timers());
        builder.events(layer.events());

        let tsx = builder.build();
        log::trace!("Transaction created [{:?}] ({:p})", tsx.0.role, tsx.0);
        tsx
    }

    pub(crate) fn new_uas(
        request: &IncomingRequest,
        layer: &TransactionLayer,
        state: State,
    ) -> Self {
        let mut builder = Self::builder();

        builder.key(TsxKey::create_server(request));
        builder.role(Role::Uas);
        builder.layer(layer.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.packet.addr);
        builder.state(state);
        builder.timers(layer.timers());
        builder.events(layer.events());

        let tsx = builder.build();
        log::trace!("Transaction created [{:?}] ({:p})", tsx.0.role, tsx.0);
        tsx
    }

    pub(crate) fn key(&self) -> &TsxKey {
        &self.0.key
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.0.transport
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    pub(crate) fn timers(&self) -> &TimerConfig {
        &self.0.timers
    }

    pub(crate) fn layer(&self) -> &TransactionLayer {
        &self.0.layer
    }

    pub(crate) fn schedule_termination(&self, time: Duration) {
        let tsx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time).await;
            tsx.on_terminated();
        });
    }

    /// Checks if the transport is reliable.
    #[inline]
    pub fn reliable(&self) -> bool {
        self.0.transport.reliable()
    }

    /// Retrieves the current state of the transaction.
    #[inline]
    pub fn state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    /// Gets the count of retransmissions.
    #[inline]
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    /// Retrieves the last status code sent or received.
    #[inline]
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    pub(crate) async fn last_msg(&self) -> Option<Bytes> {
        self.0.last_msg.read().await.clone()
    }

    pub(crate) fn on_terminated(&self) {
        self.change_state_to(State::Terminated);
        let key = &self.0.key;

        match self.0.role {
            Role::Uac => {
                self.0.layer.remove_client_tsx(key);
            }
            Role::Uas => {
                self.0.layer.remove_server_tsx(key);
            }
        };
    }

    pub(crate) fn change_state_to(&self, state: State) {
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            mem::replace(&mut *guard, state)
        };
        log::trace!("State changed [{old:?} -> {state:?}] ({:p})", self.0);
    }

    #[inline]
    pub(crate) fn set_last_status_code(&self, code: StatusCode) {
        let mut guard = self.0.status_code.write().expect("Lock failed");
        *guard = Some(code);
    }

    pub(crate) async fn set_last_msg(&self, msg: Bytes) {
        let mut guard = self.0.last_msg.write().await;
        *guard = Some(msg);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.state() == State::Calling
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state(), State::Trying | State::Proceeding | State::Calling)
    }

    pub(crate) fn notify_timeout(&self) {
        if let Some(events) = &self.0.events {
            let _ = events.try_send(TsxEvent::TimedOut {
                key: self.0.key.clone(),
            });
        }
    }

    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let retransmitted = {
            let lock = self.0.last_msg.read().await;
            if let Some(msg) = lock.as_ref() {
                self.0.transport.send(msg, &self.0.addr).await?;
                true
            } else {
                false
            }
        };

        if retransmitted {
            Ok(self.add_retrans_count())
        } else {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "No message to retransmit",
            )))
        }
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        log::debug!("=> Request {} to /{}", msg.msg.req_line.method, msg.addr);
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_msg(buf).await;
        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        log::debug!("=> Response {} {}", code.into_u16(), msg.reason());
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };

        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_status_code(code);
        self.set_last_msg(buf).await;
        Ok(())
    }
}

/// Builder for a transaction core.
#[derive(Default)]
pub(crate) struct Builder {
    role: Option<Role>,
    layer: Option<TransactionLayer>,
    key: Option<TsxKey>,
    transport: Option<Arc<dyn Transport>>,
    addr: Option<SocketAddr>,
    state: Option<Mutex<State>>,
    timers: Option<TimerConfig>,
    events: Option<TsxEventTx>,
}

impl Builder {
    pub fn role(&mut self, role: Role) -> &mut Self {
        self.role = Some(role);
        self
    }

    pub fn layer(&mut self, layer: TransactionLayer) -> &mut Self {
        self.layer = Some(layer);
        self
    }

    pub fn key(&mut self, key: TsxKey) -> &mut Self {
        self.key = Some(key);
        self
    }

    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    pub fn addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.addr = Some(addr);
        self
    }

    pub fn state(&mut self, state: State) -> &mut Self {
        self.state = Some(Mutex::new(state));
        self
    }

    pub fn timers(&mut self, timers: TimerConfig) -> &mut Self {
        self.timers = Some(timers);
        self
    }

    pub fn events(&mut self, events: Option<TsxEventTx>) -> &mut Self {
        self.events = events;
        self
    }

    pub fn build(self) -> TsxCore {
        let inner = Inner {
            role: self.role.expect("Role is required"),
            layer: self.layer.expect("Layer is required"),
            key: self.key.expect("Key is required"),
            transport: self.transport.expect("Transport is required"),
            addr: self.addr.expect("Address is required"),
            state: self.state.expect("State is required"),
            status_code: Default::default(),
            last_msg: Default::default(),
            retransmit_count: Default::default(),
            timers: self.timers.unwrap_or_default(),
            events: self.events,
        };

        TsxCore(Arc::new(inner))
    }
}

/// The possible roles of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// User Agent Client: the entity that initiates the request.
    Uac,
    /// User Agent Server: the entity that responds to the request.
    Uas,
}

/// The possible states of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Initial state, nothing sent yet.
    #[default]
    Initial,
    /// INVITE client waiting for any response.
    Calling,
    /// Non-INVITE transaction awaiting progress.
    Trying,
    /// A provisional response was seen.
    Proceeding,
    /// A final response was seen; absorbing retransmissions.
    Completed,
    /// The INVITE server saw the ACK.
    Confirmed,
    /// The transaction is finished.
    Terminated,
}

/// A server transaction, either INVITE or non-INVITE.
#[derive(Clone)]
pub enum ServerTsx {
    /// A non-INVITE server transaction.
    NonInvite(ServerTransaction),
    /// An INVITE server transaction.
    Invite(InvServerTransaction),
}

impl std::fmt::Debug for ServerTsx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerTsx::NonInvite(_) => f.write_str("ServerTsx::NonInvite(..)"),
            ServerTsx::Invite(_) => f.write_str("ServerTsx::Invite(..)"),
        }
    }
}

impl ServerTsx {
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ServerTsx::NonInvite(uas) => uas.last_status_code(),
            ServerTsx::Invite(uas_inv) => uas_inv.last_status_code(),
        }
    }

    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.key(),
            ServerTsx::Invite(uas_inv) => uas_inv.key(),
        }
    }

    pub(crate) fn state(&self) -> State {
        match self {
            ServerTsx::NonInvite(uas) => uas.state(),
            ServerTsx::Invite(uas_inv) => uas_inv.state(),
        }
    }

    /// Handles a request matching this transaction: a retransmission
    /// to be absorbed, or the ACK completing an INVITE.
    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => {
                if matches!(uas.state(), State::Proceeding | State::Completed) {
                    uas.retransmit().await?;
                }
                Ok(())
            }
            ServerTsx::Invite(uas_inv) => {
                match uas_inv.state() {
                    State::Completed if request.is_method(&SipMethod::Ack) => {
                        uas_inv.on_ack();
                    }
                    State::Proceeding | State::Completed => {
                        uas_inv.retransmit().await?;
                    }
                    _ => (),
                }
                Ok(())
            }
        }
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

/// A client transaction, either INVITE or non-INVITE.
#[derive(Clone)]
pub enum ClientTsx {
    /// A non-INVITE client transaction.
    NonInvite(ClientTransaction),
    /// An INVITE client transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.key(),
            ClientTsx::Invite(uac_inv) => uac_inv.key(),
        }
    }

    pub(crate) fn state(&self) -> State {
        match self {
            ClientTsx::NonInvite(uac) => uac.state(),
            ClientTsx::Invite(uac_inv) => uac_inv.state(),
        }
    }

    /// Sends CANCEL for a pending INVITE client transaction.
    pub(crate) async fn cancel(&self) -> Result<()> {
        match self {
            ClientTsx::NonInvite(_) => Ok(()),
            ClientTsx::Invite(uac_inv) => uac_inv.send_cancel().await,
        }
    }
}

/// What the layer decided about an incoming response.
pub enum ResponseDisposition {
    /// No transaction matched; drop or relay statelessly.
    Unmatched,
    /// The transaction absorbed it (retransmission).
    Absorbed,
    /// Deliver to the TU together with the matched transaction.
    Deliver(ClientTsx),
}

struct LayerInner {
    client_transactions: Mutex<HashMap<TsxKey, ClientTsx>>,
    server_transactions: Mutex<HashMap<TsxKey, ServerTsx>>,
    timers: TimerConfig,
    events: Mutex<Option<TsxEventTx>>,
}

/// One call's transactions.
///
/// Holds all server and client transactions created by the TU for a
/// single call process.
#[derive(Clone)]
pub struct TransactionLayer(Arc<LayerInner>);

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl TransactionLayer {
    pub fn new(timers: TimerConfig) -> Self {
        TransactionLayer(Arc::new(LayerInner {
            client_transactions: Default::default(),
            server_transactions: Default::default(),
            timers,
            events: Default::default(),
        }))
    }

    pub(crate) fn timers(&self) -> TimerConfig {
        self.0.timers
    }

    /// Routes timeout notices to the owning call process.
    pub(crate) fn set_events(&self, tx: TsxEventTx) {
        *self.0.events.lock().expect("Lock failed") = Some(tx);
    }

    pub(crate) fn events(&self) -> Option<TsxEventTx> {
        self.0.events.lock().expect("Lock failed").clone()
    }

    /// `true` when no transaction is alive.
    pub fn is_empty(&self) -> bool {
        self.0.client_transactions.lock().expect("Lock failed").is_empty()
            && self.0.server_transactions.lock().expect("Lock failed").is_empty()
    }

    /// Removes a server transaction.
    #[inline]
    pub fn remove_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.0.server_transactions.lock().expect("Lock failed").remove(key)
    }

    /// Removes a client transaction.
    #[inline]
    pub fn remove_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.0.client_transactions.lock().expect("Lock failed").remove(key)
    }

    #[inline]
    pub(crate) fn add_server_tsx(&self, tsx: ServerTsx) {
        let key = tsx.key().clone();
        self.0
            .server_transactions
            .lock()
            .expect("Lock failed")
            .insert(key, tsx);
    }

    #[inline]
    pub(crate) fn add_client_tsx(&self, tsx: ClientTsx) {
        let key = tsx.key().clone();
        self.0
            .client_transactions
            .lock()
            .expect("Lock failed")
            .insert(key, tsx);
    }

    pub(crate) fn find_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.0
            .server_transactions
            .lock()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    pub(crate) fn find_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.0
            .client_transactions
            .lock()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    /// All live server transactions, for drain on forced termination.
    pub(crate) fn server_transactions(&self) -> Vec<ServerTsx> {
        self.0
            .server_transactions
            .lock()
            .expect("Lock failed")
            .values()
            .cloned()
            .collect()
    }

    /// Matches an incoming response against the client transactions.
    pub(crate) async fn handle_response(
        &self,
        response: &IncomingResponse,
    ) -> Result<ResponseDisposition> {
        let key = TsxKey::create_client_for_response(response);

        let Some(client_tsx) = self.find_client_tsx(&key) else {
            return Ok(ResponseDisposition::Unmatched);
        };

        let absorbed = match &client_tsx {
            ClientTsx::NonInvite(tsx) => tsx.receive(response).await?,
            ClientTsx::Invite(tsx_inv) => tsx_inv.receive(response).await?,
        };

        if absorbed {
            Ok(ResponseDisposition::Absorbed)
        } else {
            Ok(ResponseDisposition::Deliver(client_tsx))
        }
    }

    /// Lets an existing server transaction absorb a request
    /// retransmission or ACK. Returns `true` when handled.
    pub(crate) async fn handle_request(&self, request: &IncomingRequest) -> Result<bool> {
        let key = TsxKey::create_server(request);

        let Some(server_tsx) = self.find_server_tsx(&key) else {
            return Ok(false);
        };

        server_tsx.receive_request(request).await?;
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;

    #[tokio::test]
    async fn test_non_invite_server_tsx() {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Register);

        let tsx = ServerTransaction::new(&layer, &request);
        let key = tsx.key().clone();

        assert_matches!(layer.find_server_tsx(&key), Some(ServerTsx::NonInvite(_)));

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_invite_server_tsx() {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Invite);

        let tsx = InvServerTransaction::new(&layer, &request);
        let key = tsx.key().clone();

        assert_matches!(layer.find_server_tsx(&key), Some(ServerTsx::Invite(_)));

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_transaction_uniqueness() {
        // No two live transactions share a key: a second insert with
        // the same key replaces the first instead of duplicating it.
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Register);

        ServerTransaction::new(&layer, &request);
        ServerTransaction::new(&layer, &request);

        let map = layer.0.server_transactions.lock().unwrap();
        assert_eq!(map.len(), 1);
    }
}
