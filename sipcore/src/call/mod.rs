//! Per-Call-ID call processes.
//!
//! One actor owns everything sharing a Call-ID: its transactions, its
//! dialogs, and any proxy forks. Inbound messages are dispatched by
//! Call-ID through the [`CallRegistry`]; a call process handles its
//! inbox strictly in arrival order and exits after a linger with no
//! live work.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::dialog::{Dialog, DialogSet};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::headers::CallId;
use crate::message::{Response, SipMethod, StatusCode, Uri};
use crate::proxy::{self, Fork, ForkAction};
use crate::router::{ProxyOpts, RouteVerdict, SipReply};
use crate::transaction::{
    ClientTransaction, ClientTsx, InvClientTransaction, InvServerTransaction, ResponseDisposition,
    ServerTransaction, ServerTsx, State, TransactionLayer, TsxEvent, TsxKey,
};
use crate::transport::{IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse};

/// The inbox of a call process.
pub(crate) enum CallEvent {
    Request(Box<IncomingRequest>),
    Response(Box<IncomingResponse>),
    /// A locally originated request to send as UAC.
    Send(Box<OutgoingRequest>),
    Tsx(TsxEvent),
    /// Timer C fired for a proxied INVITE.
    ForkTimeout { server_key: TsxKey },
    /// Forced shutdown: drain and exit.
    Terminate,
}

/// A handle to a running call process.
#[derive(Clone)]
pub(crate) struct CallHandle {
    tx: mpsc::Sender<CallEvent>,
}

impl CallHandle {
    pub async fn send(&self, event: CallEvent) -> Result<()> {
        self.tx.send(event).await?;
        Ok(())
    }
}

/// All running call processes, keyed by Call-ID.
#[derive(Default)]
pub(crate) struct CallRegistry {
    calls: Mutex<HashMap<CallId, CallHandle>>,
}

impl CallRegistry {
    pub fn find(&self, call_id: &CallId) -> Option<CallHandle> {
        self.calls.lock().expect("Lock failed").get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &CallId) {
        self.calls.lock().expect("Lock failed").remove(call_id);
    }

    /// Finds the call for a request, spawning a new process when none
    /// exists yet.
    pub fn find_or_spawn(&self, call_id: &CallId, endpoint: &Endpoint) -> CallHandle {
        let mut calls = self.calls.lock().expect("Lock failed");
        if let Some(handle) = calls.get(call_id) {
            return handle.clone();
        }

        let handle = CallProcess::spawn(call_id.clone(), endpoint.clone());
        calls.insert(call_id.clone(), handle.clone());
        handle
    }

    /// Asks every call process to terminate.
    pub async fn terminate_all(&self) {
        let handles: Vec<CallHandle> = self
            .calls
            .lock()
            .expect("Lock failed")
            .values()
            .cloned()
            .collect();
        for handle in handles {
            let _ = handle.send(CallEvent::Terminate).await;
        }
    }
}

/// The actor owning one Call-ID's state.
struct CallProcess {
    call_id: CallId,
    endpoint: Endpoint,
    transactions: TransactionLayer,
    dialogs: DialogSet,
    /// Forks keyed by the server transaction they answer.
    forks: HashMap<TsxKey, Fork>,
    /// Branch client key → owning fork's server key.
    branch_owner: HashMap<TsxKey, TsxKey>,
    /// The original request behind each live server transaction,
    /// recorded as soon as the transaction exists so CANCEL, drain,
    /// and fork work can answer through it.
    server_requests: HashMap<TsxKey, IncomingRequest>,
    tx: mpsc::Sender<CallEvent>,
}

impl CallProcess {
    fn spawn(call_id: CallId, endpoint: Endpoint) -> CallHandle {
        let (tx, rx) = mpsc::channel(64);

        let transactions = TransactionLayer::new(endpoint.timers());
        let (tsx_tx, mut tsx_rx) = mpsc::channel(16);
        transactions.set_events(tsx_tx);

        // Transaction timeouts arrive as messages like everything else.
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = tsx_rx.recv().await {
                if forward_tx.send(CallEvent::Tsx(event)).await.is_err() {
                    break;
                }
            }
        });

        let process = CallProcess {
            call_id: call_id.clone(),
            endpoint,
            transactions,
            dialogs: DialogSet::new(),
            forks: HashMap::new(),
            branch_owner: HashMap::new(),
            server_requests: HashMap::new(),
            tx: tx.clone(),
        };

        log::debug!("Call process spawned for {call_id}");
        tokio::spawn(process.run(rx));

        CallHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CallEvent>) {
        let linger = self.endpoint.config().call_linger;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        CallEvent::Request(request) => {
                            if let Err(err) = self.on_request(*request).await {
                                log::warn!("Call {}: request failed: {err}", self.call_id);
                            }
                        }
                        CallEvent::Response(response) => {
                            if let Err(err) = self.on_response(*response).await {
                                log::warn!("Call {}: response failed: {err}", self.call_id);
                            }
                        }
                        CallEvent::Send(request) => {
                            if let Err(err) = self.on_send(*request).await {
                                log::warn!("Call {}: send failed: {err}", self.call_id);
                            }
                        }
                        CallEvent::Tsx(TsxEvent::TimedOut { key }) => {
                            self.on_tsx_timeout(key).await;
                        }
                        CallEvent::ForkTimeout { server_key } => {
                            self.on_fork_timeout(server_key).await;
                        }
                        CallEvent::Terminate => {
                            self.drain().await;
                            break;
                        }
                    }
                }
                // Transactions purge themselves on their own timers,
                // so idleness is re-checked every linger period.
                _ = tokio::time::sleep(linger) => {
                    if self.is_idle() {
                        break;
                    }
                }
            }
        }

        log::debug!("Call process for {} exiting", self.call_id);
        self.endpoint.calls().remove(&self.call_id);
    }

    fn is_idle(&self) -> bool {
        self.transactions.is_empty() && self.dialogs.is_empty() && self.forks.is_empty()
    }

    /// Drains on forced termination: still-Proceeding INVITE servers
    /// answer 487 and pending branches are cancelled.
    async fn drain(&mut self) {
        for fork in self.forks.values_mut() {
            for action in fork.cancel_all() {
                if let ForkAction::CancelBranches { keys } = action {
                    for key in keys {
                        if let Some(tsx) = self.transactions.find_client_tsx(&key) {
                            let _ = tsx.cancel().await;
                        }
                    }
                }
            }
        }

        for server_tsx in self.transactions.server_transactions() {
            if let ServerTsx::Invite(tsx) = server_tsx {
                if tsx.state() == State::Proceeding {
                    if let Some(request) = self.server_requests.get(tsx.key()) {
                        let mut response = self.endpoint.new_response(
                            request,
                            StatusCode::RequestTerminated,
                            None,
                        );
                        let _ = tsx.respond(&mut response).await;
                    }
                }
            }
        }
    }

    async fn on_request(&mut self, request: IncomingRequest) -> Result<()> {
        log::debug!("<= Request {} from /{}", request.method(), request.addr());

        // Retransmissions and ACKs for non-2xx land in an existing
        // transaction.
        if self.transactions.handle_request(&request).await? {
            return Ok(());
        }

        match request.method().clone() {
            SipMethod::Ack => {
                // ACK for a 2xx: ends up at the dialog, no transaction.
                self.dialogs.on_request(&request);
                Ok(())
            }
            SipMethod::Cancel => self.on_cancel(request).await,
            SipMethod::Register if self.endpoint.registrar().is_some() => {
                self.on_register(request).await
            }
            SipMethod::Publish => {
                let reply = self.endpoint.application().publish(&request).await;
                self.respond_with(&request, reply).await
            }
            _ => {
                if request.core.to.tag().is_some() {
                    // In-dialog request: an unknown dialog gets 481
                    // (RFC 3261 §12.2.2).
                    if self.dialogs.on_request(&request) {
                        self.on_in_dialog_request(request).await
                    } else {
                        self.respond_with(
                            &request,
                            SipReply::new(StatusCode::CallOrTransactionDoesNotExist),
                        )
                        .await
                    }
                } else {
                    self.route(request).await
                }
            }
        }
    }

    /// CANCEL: its own server transaction, honored only while the
    /// INVITE server is Proceeding (RFC 3261 §9.2).
    async fn on_cancel(&mut self, request: IncomingRequest) -> Result<()> {
        let target_key = TsxKey::cancel_target(&request);
        let cancel_tsx = ServerTransaction::new(&self.transactions, &request);

        let Some(ServerTsx::Invite(invite_tsx)) = self.transactions.find_server_tsx(&target_key)
        else {
            let mut response = self.endpoint.new_response(
                &request,
                StatusCode::CallOrTransactionDoesNotExist,
                None,
            );
            return cancel_tsx.respond(&mut response).await;
        };

        if invite_tsx.state() != State::Proceeding {
            let mut response = self.endpoint.new_response(
                &request,
                StatusCode::CallOrTransactionDoesNotExist,
                None,
            );
            return cancel_tsx.respond(&mut response).await;
        }

        // 200 to the CANCEL first, then 487 to the INVITE.
        let mut ok = self.endpoint.new_response(&request, StatusCode::Ok, None);
        cancel_tsx.respond(&mut ok).await?;

        if let Some(invite_request) = self.server_requests.get(&target_key) {
            let mut terminated =
                self.endpoint
                    .new_response(invite_request, StatusCode::RequestTerminated, None);
            let local_tag = terminated
                .response
                .headers
                .to_hdr()
                .and_then(|to| to.tag())
                .map(std::sync::Arc::from);
            invite_tsx.respond(&mut terminated).await?;

            // An early dialog the 1xx created dies with the 487.
            if let (Some(local_tag), Some(remote_tag)) =
                (local_tag, invite_request.core.from.tag())
            {
                let id = crate::dialog::DialogId {
                    call_id: invite_request.core.call_id.clone(),
                    local_tag,
                    remote_tag: remote_tag.into(),
                };
                self.dialogs.remove(&id);
            }
        }

        // A proxied INVITE propagates the CANCEL downstream; a locally
        // answered one is settled and its request can go.
        if let Some(fork) = self.forks.get_mut(&target_key) {
            let actions = fork.cancel_all();
            self.apply_fork_actions(target_key, actions).await?;
        } else {
            self.server_requests.remove(&target_key);
        }

        Ok(())
    }

    /// Sends a locally originated request through a fresh client
    /// transaction so its responses route back here.
    async fn on_send(&mut self, request: OutgoingRequest) -> Result<()> {
        if request.msg.method().is_invite() {
            InvClientTransaction::send(request, &self.transactions).await?;
        } else {
            ClientTransaction::send(request, &self.transactions).await?;
        }
        Ok(())
    }

    async fn on_register(&mut self, request: IncomingRequest) -> Result<()> {
        let tsx = ServerTransaction::new(&self.transactions, &request);
        let registrar = self.endpoint.registrar().expect("checked by caller").clone();

        // The registrar actor needs the request; keep what the reply
        // needs here.
        let reply = match registrar.register(request.clone_for_reply()).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("Registrar failed: {err}");
                SipReply::new(StatusCode::ServerInternalError)
            }
        };

        let mut response = self.endpoint.reply_response(&request, reply);
        tsx.respond(&mut response).await
    }

    async fn on_in_dialog_request(&mut self, request: IncomingRequest) -> Result<()> {
        match request.method().clone() {
            SipMethod::Bye | SipMethod::Notify | SipMethod::Subscribe | SipMethod::Update
            | SipMethod::Info | SipMethod::Message => {
                let tsx = ServerTransaction::new(&self.transactions, &request);
                let mut response = self.endpoint.new_response(&request, StatusCode::Ok, None);
                tsx.respond(&mut response).await
            }
            SipMethod::Invite => {
                // Re-INVITE: the application answers.
                self.answer_invite_locally(request).await
            }
            _ => {
                let tsx = ServerTransaction::new(&self.transactions, &request);
                let reply = self.endpoint.application().on_request(&request).await;
                let mut response = self.endpoint.reply_response(&request, reply);
                tsx.respond(&mut response).await
            }
        }
    }

    /// A new out-of-dialog request: ask the application.
    async fn route(&mut self, request: IncomingRequest) -> Result<()> {
        let (scheme, user, domain) = RouteVerdict::request_uri_parts(request.request.uri());
        let application = self.endpoint.application().clone();
        let call_id = self.call_id.clone();

        let verdict = std::panic::AssertUnwindSafe(application.route(
            scheme,
            &user,
            &domain,
            &request,
            &call_id,
        ))
        .catch_unwind()
        .await;

        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(_) => {
                // A panicking callback turns into a plain 500.
                log::warn!("Application route callback panicked");
                return self
                    .respond_with(&request, SipReply::new(StatusCode::ServerInternalError))
                    .await;
            }
        };

        match verdict {
            RouteVerdict::Process => self.process_locally(request).await,
            RouteVerdict::ProxyTo(targets, opts) => self.proxy(request, targets, opts).await,
            RouteVerdict::ProxyRequestUri(opts) => {
                let target = request.request.uri().clone();
                self.proxy(request, vec![target], opts).await
            }
            RouteVerdict::Reply(reply) => self.respond_with(&request, reply).await,
            RouteVerdict::ReplyStateless(reply) => {
                self.endpoint.respond_stateless(&request, reply).await
            }
        }
    }

    /// Consumes a request locally (UAS handler chain).
    async fn process_locally(&mut self, request: IncomingRequest) -> Result<()> {
        if request.method().is_invite() {
            self.answer_invite_locally(request).await
        } else {
            let reply = self.endpoint.application().on_request(&request).await;
            self.respond_with(&request, reply).await
        }
    }

    /// An INVITE consumed locally: the server transaction enters
    /// Proceeding on arrival, before the application is consulted, so
    /// a racing CANCEL finds it (RFC 3261 §9.2).
    async fn answer_invite_locally(&mut self, request: IncomingRequest) -> Result<()> {
        let tsx = self.accept_invite(&request);
        let reply = self.endpoint.application().on_request(&request).await;
        self.respond_invite(&tsx, &request, reply).await
    }

    /// Creates the INVITE server transaction and records its request
    /// so CANCEL and drain can answer through it.
    fn accept_invite(&mut self, request: &IncomingRequest) -> InvServerTransaction {
        let tsx = InvServerTransaction::new(&self.transactions, request);
        self.server_requests
            .insert(tsx.key().clone(), request.clone_for_reply());
        tsx
    }

    /// Sends `reply` through an already accepted INVITE transaction.
    /// The recorded request stays as long as only provisionals went
    /// out; a final response settles the INVITE and drops it.
    async fn respond_invite(
        &mut self,
        tsx: &InvServerTransaction,
        request: &IncomingRequest,
        reply: SipReply,
    ) -> Result<()> {
        let is_final = reply.code.is_final();
        let mut response = self.endpoint.reply_response(request, reply);
        self.mirror_uas_dialog(request, &response);

        let result = tsx.respond(&mut response).await;
        if is_final {
            self.server_requests.remove(tsx.key());
        }
        result
    }

    /// Answers a request through a freshly created server transaction.
    async fn respond_with(&mut self, request: &IncomingRequest, reply: SipReply) -> Result<()> {
        if request.method().is_invite() {
            let tsx = self.accept_invite(request);
            self.respond_invite(&tsx, request, reply).await
        } else {
            let mut response = self.endpoint.reply_response(request, reply);
            self.mirror_uas_dialog(request, &response);
            let tsx = ServerTransaction::new(&self.transactions, request);
            tsx.respond(&mut response).await
        }
    }

    /// Mirrors the dialog a dialog-creating response establishes on
    /// the UAS side (RFC 3261 §12.1.1).
    fn mirror_uas_dialog(&mut self, request: &IncomingRequest, response: &OutgoingResponse) {
        if !request.method().can_establish_a_dialog() {
            return;
        }
        let code = response.response.code();
        if code.class() > 2 || code == StatusCode::Trying {
            return;
        }

        let local_tag = response
            .response
            .headers
            .to_hdr()
            .and_then(|to| to.tag())
            .map(std::sync::Arc::from);
        if let Some(local_tag) = local_tag {
            if let Some(mut dialog) = Dialog::new_uas(request, local_tag) {
                if code.class() == 2 {
                    dialog.confirm();
                }
                self.dialogs.insert(dialog);
            }
        }
    }

    /// Stateful proxying, forking when there is more than one target.
    async fn proxy(
        &mut self,
        request: IncomingRequest,
        targets: Vec<Uri>,
        opts: ProxyOpts,
    ) -> Result<()> {
        let opts = match self.endpoint.plugins().uac_proxy_opts(&request, opts).await {
            crate::plugin::HookOutcome::Continue(opts) => opts,
            crate::plugin::HookOutcome::ShortCircuit(reply) => {
                return self.respond_with(&request, reply).await;
            }
        };

        if let Err(reply) = proxy::validate(&request) {
            return self.respond_with(&request, reply).await;
        }

        let is_invite = request.method().is_invite();
        let server_key = if is_invite {
            let tsx = self.accept_invite(&request);
            let mut trying = self.endpoint.new_response(&request, StatusCode::Trying, None);
            tsx.respond(&mut trying).await?;
            tsx.key().clone()
        } else {
            let tsx = ServerTransaction::new(&self.transactions, &request);
            self.server_requests
                .insert(tsx.key().clone(), request.clone_for_reply());
            tsx.key().clone()
        };

        let mode = proxy::fork_mode_for(&opts, &targets);
        let (fork, actions) = Fork::new(server_key.clone(), targets, mode, opts);

        self.forks.insert(server_key.clone(), fork);

        // Timer C bounds the whole INVITE hunt.
        if is_invite {
            let tc = self.endpoint.timers().tc;
            let tx = self.tx.clone();
            let key = server_key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(tc).await;
                let _ = tx.send(CallEvent::ForkTimeout { server_key: key }).await;
            });
        }

        self.apply_fork_actions(server_key, actions).await
    }

    async fn apply_fork_actions(&mut self, server_key: TsxKey, actions: Vec<ForkAction>) -> Result<()> {
        for action in actions {
            match action {
                ForkAction::LaunchBranch { target } => {
                    self.launch_branch(&server_key, target).await?;
                }
                ForkAction::CancelBranches { keys } => {
                    for key in keys {
                        match self.transactions.find_client_tsx(&key) {
                            Some(tsx) => tsx.cancel().await?,
                            None => log::debug!("Branch {key:?} already gone, skipping CANCEL"),
                        }
                    }
                }
                ForkAction::ForwardUpstream { response } => {
                    self.forward_upstream(&server_key, response).await?;
                }
            }
        }

        if self.forks.get(&server_key).is_some_and(|f| f.is_finished()) {
            self.retire_fork(&server_key);
        }

        Ok(())
    }

    async fn launch_branch(&mut self, server_key: &TsxKey, target: Uri) -> Result<()> {
        let Some(request) = self.server_requests.get(server_key) else {
            return Ok(());
        };
        let Some(fork) = self.forks.get(server_key) else {
            return Ok(());
        };

        let local = self.endpoint.local_info(request.transport.kind());
        let branch = proxy::fresh_branch(&proxy::fingerprint(request));
        let prepared = proxy::prepare_branch(request, &target, fork.opts(), &local, branch.clone());

        let method = prepared.req_line.method.clone();
        let branch_key = TsxKey::create_client_with(&method, branch);

        let next_hop = proxy::next_hop(&prepared).clone();
        let outgoing = match self.endpoint.resolve_target(&next_hop) {
            Ok((addr, transport)) => OutgoingRequest {
                msg: prepared,
                addr,
                buf: None,
                transport,
            },
            Err(err) => {
                log::warn!("Cannot resolve branch target {next_hop}: {err}");
                return self.branch_send_failed(server_key, branch_key, target).await;
            }
        };

        let send_result = if method.is_invite() {
            InvClientTransaction::send(outgoing, &self.transactions)
                .await
                .map(|tsx| tsx.key().clone())
        } else {
            ClientTransaction::send(outgoing, &self.transactions)
                .await
                .map(|tsx| tsx.key().clone())
        };

        match send_result {
            Ok(key) => {
                if let Some(fork) = self.forks.get_mut(server_key) {
                    fork.branch_launched(key.clone(), target);
                }
                self.branch_owner.insert(key, server_key.clone());
                Ok(())
            }
            Err(err) => {
                log::warn!("Branch send failed: {err}");
                self.branch_send_failed(server_key, branch_key, target).await
            }
        }
    }

    /// A branch that never left the building counts as 503.
    async fn branch_send_failed(
        &mut self,
        server_key: &TsxKey,
        branch_key: TsxKey,
        target: Uri,
    ) -> Result<()> {
        let actions = {
            let Some(fork) = self.forks.get_mut(server_key) else {
                return Ok(());
            };
            fork.branch_launched(branch_key.clone(), target);
            let unavailable = Response {
                status_line: StatusCode::ServiceUnavailable.into(),
                headers: Default::default(),
                body: None,
            };
            fork.on_final(&branch_key, &unavailable)
        };
        Box::pin(self.apply_fork_actions(server_key.clone(), actions)).await
    }

    async fn forward_upstream(&mut self, server_key: &TsxKey, response: Response) -> Result<()> {
        let Some(request) = self.server_requests.get(server_key) else {
            return Ok(());
        };
        let response = proxy::upstream_response(response);
        let code = response.code();
        let mut outgoing = self.endpoint.forwarded_response(request, response);

        match self.transactions.find_server_tsx(server_key) {
            Some(ServerTsx::Invite(tsx)) => tsx.respond(&mut outgoing).await,
            Some(ServerTsx::NonInvite(tsx)) => tsx.respond(&mut outgoing).await,
            None => {
                // A later 2xx after the INVITE transaction ended is
                // forwarded statelessly (RFC 3261 §16.7 rule 10).
                log::debug!("Forwarding {} without server transaction", code.into_u16());
                self.endpoint.send_response(&mut outgoing).await
            }
        }
    }

    fn retire_fork(&mut self, server_key: &TsxKey) {
        self.forks.remove(server_key);
        self.branch_owner.retain(|_, owner| owner != server_key);
        self.server_requests.remove(server_key);
    }

    async fn on_response(&mut self, response: IncomingResponse) -> Result<()> {
        log::debug!(
            "<= Response ({} {}) from /{}",
            response.code().into_u16(),
            response.response.reason(),
            response.addr(),
        );

        match self.transactions.handle_response(&response).await? {
            ResponseDisposition::Unmatched => {
                log::debug!("Dropping response with no matching transaction");
                Ok(())
            }
            ResponseDisposition::Absorbed => Ok(()),
            ResponseDisposition::Deliver(tsx) => {
                if let Some(server_key) = self.branch_owner.get(tsx.key()).cloned() {
                    self.deliver_to_fork(server_key, &tsx, &response).await
                } else {
                    // Our own UAC transaction (CANCEL, local client).
                    self.dialogs.uac_on_response(&response);
                    self.endpoint.application().on_response(&response).await;
                    Ok(())
                }
            }
        }
    }

    async fn deliver_to_fork(
        &mut self,
        server_key: TsxKey,
        tsx: &ClientTsx,
        response: &IncomingResponse,
    ) -> Result<()> {
        let Some(fork) = self.forks.get_mut(&server_key) else {
            return Ok(());
        };

        let actions = if response.code().is_provisional() {
            fork.on_provisional(tsx.key(), &response.response)
        } else {
            fork.on_final(tsx.key(), &response.response)
        };

        self.apply_fork_actions(server_key, actions).await
    }

    async fn on_tsx_timeout(&mut self, key: TsxKey) {
        if let Some(server_key) = self.branch_owner.get(&key).cloned() {
            let actions = match self.forks.get_mut(&server_key) {
                Some(fork) => fork.on_branch_timeout(&key),
                None => return,
            };
            if let Err(err) = self.apply_fork_actions(server_key, actions).await {
                log::warn!("Fork timeout handling failed: {err}");
            }
        } else {
            log::debug!("Client transaction {key:?} timed out");
        }
    }

    /// Timer C: end the hunt with 408 when nothing final arrived.
    async fn on_fork_timeout(&mut self, server_key: TsxKey) {
        let actions = {
            let Some(fork) = self.forks.get_mut(&server_key) else {
                return;
            };
            if fork.is_finished() {
                return;
            }
            fork.cancel_all()
        };

        if let Err(err) = self.apply_fork_actions(server_key.clone(), actions).await {
            log::warn!("Fork cancel failed: {err}");
        }

        if let Some(request) = self.server_requests.get(&server_key) {
            let mut response =
                self.endpoint
                    .new_response(request, StatusCode::RequestTimeout, None);
            if let Some(ServerTsx::Invite(tsx)) = self.transactions.find_server_tsx(&server_key) {
                let _ = tsx.respond(&mut response).await;
            }
        }
        self.retire_fork(&server_key);
    }
}

impl IncomingRequest {
    /// A deep copy handed to the registrar actor; the original stays
    /// with the server transaction for the reply.
    pub(crate) fn clone_for_reply(&self) -> IncomingRequest {
        IncomingRequest {
            request: self.request.clone(),
            transport: self.transport.clone(),
            packet: self.packet.clone(),
            core: self.core.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;

    use crate::endpoint::Builder;
    use crate::headers::{CSeq, CallId, Contact, Header, HeaderParse, Headers, MaxForwards};
    use crate::message::{Request, Scheme, SipMsg, StatusLine};
    use crate::parser::Parser;
    use crate::router::{Application, RouteVerdict};
    use crate::transport::udp::mock::MockUdpTransport;
    use crate::transport::{CoreHeaders, Packet, Payload};

    /// Proxies every request to a fixed target set.
    struct ProxyApp {
        targets: Vec<&'static str>,
        opts: ProxyOpts,
    }

    #[async_trait::async_trait]
    impl Application for ProxyApp {
        async fn route(
            &self,
            _scheme: Scheme,
            _user: &str,
            _domain: &str,
            _request: &IncomingRequest,
            _call: &CallId,
        ) -> RouteVerdict {
            let targets = self.targets.iter().map(|t| t.parse().unwrap()).collect();
            RouteVerdict::ProxyTo(targets, self.opts.clone())
        }
    }

    async fn proxy_endpoint(targets: Vec<&'static str>, opts: ProxyOpts) -> (Endpoint, Arc<MockUdpTransport>) {
        let endpoint = Builder::new()
            .with_name("proxy")
            .with_local_host("proxy.nksip")
            .with_application(ProxyApp { targets, opts })
            .build()
            .await;
        let mock = Arc::new(MockUdpTransport::new());
        endpoint.transport().add_transport(mock.clone());
        (endpoint, mock)
    }

    fn incoming_request(
        method: SipMethod,
        branch: &str,
        transport: &Arc<MockUdpTransport>,
    ) -> IncomingRequest {
        let via = crate::headers::Via::from_bytes(
            format!("SIP/2.0/UDP 127.0.0.1:5070;branch={branch};received=127.0.0.1").as_bytes(),
        )
        .unwrap();
        let from =
            crate::headers::From::from_bytes(b"<sip:alice@nksip>;tag=caller-tag").unwrap();
        let to = crate::headers::To::from_bytes(b"<sip:bob@nksip>").unwrap();
        let call_id = CallId::new("fork-call-1");
        let cseq = CSeq::new(1, method.clone());

        let core = CoreHeaders {
            via: via.clone(),
            from: from.clone(),
            to: to.clone(),
            cseq: cseq.clone(),
            call_id: call_id.clone(),
        };

        let mut headers = Headers::with_capacity(6);
        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(Header::CallId(call_id));
        headers.push(Header::CSeq(cseq));
        headers.push(Header::MaxForwards(MaxForwards::default()));

        IncomingRequest {
            request: Request {
                req_line: crate::message::RequestLine {
                    method,
                    uri: "sip:bob@nksip".parse().unwrap(),
                },
                headers,
                body: None,
            },
            transport: transport.clone(),
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr: "127.0.0.1:5070".parse().unwrap(),
                time: SystemTime::now(),
            },
            core,
        }
    }

    /// Finds the latest forwarded request for `target_user` among the
    /// sent messages and parses it back.
    fn sent_request_to(mock: &MockUdpTransport, method: &str, target_user: &str) -> Request {
        let line = format!("{method} sip:{target_user}@");
        let raw = mock
            .sent_messages()
            .into_iter()
            .filter(|m| m.starts_with(&line))
            .last()
            .unwrap_or_else(|| panic!("no {method} sent towards {target_user}"));

        let msg = Parser::new(raw.as_bytes()).parse_sip_msg().unwrap();
        match msg {
            SipMsg::Request(request) => request,
            SipMsg::Response(_) => unreachable!(),
        }
    }

    /// Builds the response a downstream target would send for the
    /// request our proxy forwarded to it.
    fn branch_response(
        sent: &Request,
        code: StatusCode,
        transport: &Arc<MockUdpTransport>,
    ) -> IncomingResponse {
        let via = sent.headers.via().unwrap().clone();
        let from = sent.headers.from_hdr().unwrap().clone();
        let mut to = sent.headers.to_hdr().unwrap().clone();
        if code != StatusCode::Trying && to.tag().is_none() {
            to.set_tag("callee-tag");
        }
        let call_id = sent.headers.call_id().unwrap().clone();
        let cseq = sent.headers.cseq().unwrap().clone();

        let mut headers = Headers::with_capacity(5);
        for v in sent.headers.vias() {
            headers.push(Header::Via(v.clone()));
        }
        headers.push(Header::From(from.clone()));
        headers.push(Header::To(to.clone()));
        headers.push(Header::CallId(call_id.clone()));
        headers.push(Header::CSeq(cseq.clone()));

        let mut response = crate::message::Response {
            status_line: StatusLine::from(code),
            headers,
            body: None,
        };
        response.headers.extend(
            sent.headers
                .record_routes()
                .cloned()
                .map(Header::RecordRoute),
        );

        IncomingResponse {
            response,
            transport: transport.clone(),
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr: "127.0.0.1:5080".parse().unwrap(),
                time: SystemTime::now(),
            },
            core: CoreHeaders {
                via,
                from,
                to,
                cseq,
                call_id,
            },
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn upstream_codes(mock: &MockUdpTransport) -> Vec<(u16, String)> {
        mock.sent_messages()
            .iter()
            .filter(|m| m.starts_with("SIP/2.0 "))
            .map(|m| {
                let rest = &m["SIP/2.0 ".len()..];
                let code = rest.split_whitespace().next().unwrap().parse().unwrap();
                let cseq = m
                    .lines()
                    .find(|l| l.starts_with("CSeq:"))
                    .unwrap_or("")
                    .to_string();
                (code, cseq)
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_forked_invite_2xx_wins_without_cancel() {
        // C1 answers 486, C2 answers 200: upstream sees exactly the
        // 200 and the completed C1 gets no CANCEL.
        let (endpoint, mock) = proxy_endpoint(
            vec!["sip:c1@127.0.0.1:5080", "sip:c2@127.0.0.1:5090"],
            ProxyOpts::default(),
        )
        .await;

        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream1", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        let to_c1 = sent_request_to(&mock, "INVITE", "c1");
        let to_c2 = sent_request_to(&mock, "INVITE", "c2");
        assert_ne!(
            to_c1.headers.via().unwrap().branch(),
            to_c2.headers.via().unwrap().branch(),
        );

        endpoint
            .process_response(branch_response(&to_c1, StatusCode::BusyHere, &mock))
            .await
            .unwrap();
        settle().await;

        endpoint
            .process_response(branch_response(&to_c2, StatusCode::Ok, &mock))
            .await
            .unwrap();
        settle().await;

        let codes = upstream_codes(&mock);
        assert!(codes.iter().any(|(code, cseq)| *code == 200 && cseq.contains("INVITE")));
        assert!(
            !codes.iter().any(|(code, _)| *code == 486),
            "the losing 486 must not reach upstream"
        );
        assert!(
            !mock.sent_messages().iter().any(|m| m.starts_with("CANCEL ")),
            "a completed branch must not receive CANCEL"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forked_invite_cancels_ringing_branch() {
        // C1 is still ringing when C2 answers 200: C1 gets CANCEL.
        let (endpoint, mock) = proxy_endpoint(
            vec!["sip:c1@127.0.0.1:5080", "sip:c2@127.0.0.1:5090"],
            ProxyOpts::default(),
        )
        .await;

        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream2", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        let to_c1 = sent_request_to(&mock, "INVITE", "c1");
        let to_c2 = sent_request_to(&mock, "INVITE", "c2");

        endpoint
            .process_response(branch_response(&to_c1, StatusCode::Ringing, &mock))
            .await
            .unwrap();
        settle().await;

        endpoint
            .process_response(branch_response(&to_c2, StatusCode::Ok, &mock))
            .await
            .unwrap();
        settle().await;

        let cancel = sent_request_to(&mock, "CANCEL", "c1");
        assert_eq!(
            cancel.headers.via().unwrap().branch(),
            to_c1.headers.via().unwrap().branch(),
            "CANCEL reuses the INVITE branch"
        );
        assert!(upstream_codes(&mock)
            .iter()
            .any(|(code, cseq)| *code == 200 && cseq.contains("INVITE")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_race_yields_200_then_487() {
        // The INVITE server is Proceeding when CANCEL arrives: 200 to
        // the CANCEL, 487 to the INVITE, and no 2xx afterwards.
        let (endpoint, mock) =
            proxy_endpoint(vec!["sip:c1@127.0.0.1:5080"], ProxyOpts::default()).await;

        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream3", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        let to_c1 = sent_request_to(&mock, "INVITE", "c1");

        let cancel = incoming_request(SipMethod::Cancel, "z9hG4bKupstream3", &mock);
        endpoint.process_request(cancel).await.unwrap();
        settle().await;

        let codes = upstream_codes(&mock);
        let cancel_ok = codes
            .iter()
            .position(|(code, cseq)| *code == 200 && cseq.contains("CANCEL"));
        let invite_487 = codes
            .iter()
            .position(|(code, cseq)| *code == 487 && cseq.contains("INVITE"));
        assert!(cancel_ok.is_some(), "CANCEL must be answered 200");
        assert!(invite_487.is_some(), "INVITE must be answered 487");
        assert!(cancel_ok < invite_487, "200 to CANCEL precedes the 487");

        // A late 2xx from the cancelled branch must not reach upstream.
        endpoint
            .process_response(branch_response(&to_c1, StatusCode::Ok, &mock))
            .await
            .unwrap();
        settle().await;

        assert!(
            !upstream_codes(&mock)
                .iter()
                .any(|(code, cseq)| *code == 200 && cseq.contains("INVITE")),
            "the INVITE transaction must not accept a 2xx after the 487"
        );
    }

    /// Consumes every request locally, answering INVITEs with 180 and
    /// leaving them ringing.
    struct RingingApp;

    #[async_trait::async_trait]
    impl Application for RingingApp {
        async fn on_request(&self, _request: &IncomingRequest) -> SipReply {
            SipReply::new(StatusCode::Ringing)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_race_on_locally_answered_invite() {
        // The INVITE is consumed locally and the application only
        // rings: the server transaction must exist (Proceeding) before
        // the application answers, so the CANCEL still gets its 200
        // and the INVITE its 487.
        let endpoint = Builder::new()
            .with_name("uas")
            .with_application(RingingApp)
            .build()
            .await;
        let mock = Arc::new(MockUdpTransport::new());
        endpoint.transport().add_transport(mock.clone());

        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream7", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        assert!(upstream_codes(&mock)
            .iter()
            .any(|(code, cseq)| *code == 180 && cseq.contains("INVITE")));

        let cancel = incoming_request(SipMethod::Cancel, "z9hG4bKupstream7", &mock);
        endpoint.process_request(cancel).await.unwrap();
        settle().await;

        let codes = upstream_codes(&mock);
        let cancel_ok = codes
            .iter()
            .position(|(code, cseq)| *code == 200 && cseq.contains("CANCEL"));
        let invite_487 = codes
            .iter()
            .position(|(code, cseq)| *code == 487 && cseq.contains("INVITE"));
        assert!(cancel_ok.is_some(), "CANCEL must be answered 200");
        assert!(invite_487.is_some(), "INVITE must be answered 487");
        assert!(cancel_ok < invite_487, "200 to CANCEL precedes the 487");
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_route_travels_with_forwarded_invite() {
        let (endpoint, mock) = proxy_endpoint(
            vec!["sip:c1@127.0.0.1:5080"],
            ProxyOpts {
                record_route: true,
                ..Default::default()
            },
        )
        .await;

        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream4", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        let to_c1 = sent_request_to(&mock, "INVITE", "c1");
        let rr = to_c1.headers.record_routes().next().expect("Record-Route inserted");
        assert!(rr.uri().lr_param);
        assert_eq!(rr.uri().host_port.host.to_string(), "proxy.nksip");

        // The callee's 200 echoes the Record-Route; upstream sees it.
        endpoint
            .process_response(branch_response(&to_c1, StatusCode::Ok, &mock))
            .await
            .unwrap();
        settle().await;

        let ok = mock
            .sent_messages()
            .into_iter()
            .find(|m| m.starts_with("SIP/2.0 200"))
            .unwrap();
        assert!(ok.contains("Record-Route: <sip:proxy.nksip;lr>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_flows_through_registrar() {
        let endpoint = Builder::new()
            .with_name("registrar")
            .with_registrar()
            .build()
            .await;
        let mock = Arc::new(MockUdpTransport::new());
        endpoint.transport().add_transport(mock.clone());

        let mut register = incoming_request(SipMethod::Register, "z9hG4bKreg1", &mock);
        register.core.cseq = CSeq::new(1, SipMethod::Register);
        register.request.headers.push(Header::Contact(
            Contact::from_bytes(b"<sip:bob@127.0.0.1:5070>").unwrap(),
        ));

        endpoint.process_request(register).await.unwrap();
        settle().await;

        let ok = mock
            .sent_messages()
            .into_iter()
            .find(|m| m.starts_with("SIP/2.0 200"))
            .expect("REGISTER answered 200");
        assert!(ok.contains("Contact: <sip:bob@127.0.0.1:5070>;expires=3600"));

        let bound = endpoint
            .registrar()
            .unwrap()
            .find("sip:bob@nksip")
            .await
            .unwrap();
        assert_eq!(bound.len(), 1);
    }

    /// Wraps a request the proxy just forwarded as if it arrived back
    /// on the wire.
    fn returned_request(
        forwarded: &Request,
        transport: &Arc<MockUdpTransport>,
    ) -> IncomingRequest {
        let mut via = forwarded.headers.via().unwrap().clone();
        via.stamp_origin("127.0.0.1:5060".parse().unwrap());

        IncomingRequest {
            request: forwarded.clone(),
            transport: transport.clone(),
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr: "127.0.0.1:5060".parse().unwrap(),
                time: SystemTime::now(),
            },
            core: CoreHeaders {
                via,
                from: forwarded.headers.from_hdr().unwrap().clone(),
                to: forwarded.headers.to_hdr().unwrap().clone(),
                cseq: forwarded.headers.cseq().unwrap().clone(),
                call_id: forwarded.headers.call_id().unwrap().clone(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_rejected_with_482() {
        let (endpoint, mock) =
            proxy_endpoint(vec!["sip:c1@127.0.0.1:5080"], ProxyOpts::default()).await;

        // First pass: the proxy forwards towards c1 and stamps its
        // fingerprint into the branch. The re-targeted request coming
        // back is a spiral, not yet a loop.
        let invite = incoming_request(SipMethod::Invite, "z9hG4bKupstream5", &mock);
        endpoint.process_request(invite).await.unwrap();
        settle().await;

        let first_pass = sent_request_to(&mock, "INVITE", "c1");
        endpoint
            .process_request(returned_request(&first_pass, &mock))
            .await
            .unwrap();
        settle().await;

        // Second pass: the target no longer changes, so the incoming
        // Via chain carries our fingerprint for this exact routing.
        let second_pass = sent_request_to(&mock, "INVITE", "c1");
        assert_ne!(
            first_pass.headers.via().unwrap().branch(),
            second_pass.headers.via().unwrap().branch(),
        );
        endpoint
            .process_request(returned_request(&second_pass, &mock))
            .await
            .unwrap();
        settle().await;

        assert!(upstream_codes(&mock).iter().any(|(code, _)| *code == 482));
    }
}
