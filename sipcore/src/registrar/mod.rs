//! SIP registrar with GRUU support (RFC 3261 §10, RFC 5627).
//!
//! The registrar is an actor: one task owns the binding store and the
//! temporary-GRUU table, fed by a command channel. Reads and writes
//! all go through the channel; expired bindings are dropped lazily on
//! read and by a periodic sweep.

mod gruu;
mod store;

pub use store::{BindingTag, MemoryStore, RegContact, RegStore};

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::{AuthOutcome, Authenticator};
use crate::error::{Error, Result};
use crate::headers::{
    Contact, ContactAddr, Header, MinExpires, ProxyAuthenticate, WwwAuthenticate,
};
use crate::message::{NameAddr, SipAddr, StatusCode, Uri};
use crate::plugin::{HookOutcome, PluginChain};
use crate::router::SipReply;
use crate::transport::IncomingRequest;

use gruu::{TempGruuEntry, TempGruuIndex};

/// Registrar configuration.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Binding lifetime when neither contact nor request says.
    pub default_expires: u32,
    /// Smallest accepted nonzero expiry; 0 disables the 423 check.
    pub min_expires: u32,
    /// How often expired bindings are swept.
    pub sweep_interval: Duration,
    /// Whether outbound (RFC 5626) processing was negotiated.
    pub outbound: bool,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            default_expires: 3600,
            min_expires: 0,
            sweep_interval: Duration::from_secs(30),
            outbound: true,
        }
    }
}

/// The per-request registrar options plugins may rewrite.
#[derive(Debug, Clone)]
pub struct RegisterOpts {
    pub default_expires: u32,
    pub min_expires: u32,
    pub outbound: bool,
}

impl From<&RegistrarConfig> for RegisterOpts {
    fn from(config: &RegistrarConfig) -> Self {
        RegisterOpts {
            default_expires: config.default_expires,
            min_expires: config.min_expires,
            outbound: config.outbound,
        }
    }
}

enum Command {
    Register {
        request: Box<IncomingRequest>,
        reply: oneshot::Sender<SipReply>,
    },
    Find {
        aor: String,
        reply: oneshot::Sender<Vec<RegContact>>,
    },
    FindGruu {
        uri: Uri,
        reply: oneshot::Sender<Option<RegContact>>,
    },
}

/// Handle to the registrar actor.
#[derive(Clone)]
pub struct Registrar {
    tx: mpsc::Sender<Command>,
}

impl Registrar {
    /// Spawns the registrar actor.
    pub fn spawn(
        store: Box<dyn RegStore>,
        auth: Arc<dyn Authenticator>,
        plugins: PluginChain,
        config: RegistrarConfig,
    ) -> Registrar {
        let (tx, rx) = mpsc::channel(64);
        let state = State {
            store,
            auth,
            plugins,
            config,
            temp_index: TempGruuIndex::default(),
        };

        tokio::spawn(state.run(rx));

        Registrar { tx }
    }

    /// Processes a REGISTER, returning the reply to send.
    pub async fn register(&self, request: IncomingRequest) -> Result<SipReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                request: Box::new(request),
                reply: reply_tx,
            })
            .await?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// All live contacts of `aor`, most recently registered first.
    pub async fn find(&self, aor: &str) -> Result<Vec<RegContact>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Find {
                aor: aor.to_string(),
                reply: reply_tx,
            })
            .await?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Resolves a GRUU to its single active contact.
    pub async fn find_gruu(&self, uri: &Uri) -> Result<Option<RegContact>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::FindGruu {
                uri: uri.clone(),
                reply: reply_tx,
            })
            .await?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }
}

struct State {
    store: Box<dyn RegStore>,
    auth: Arc<dyn Authenticator>,
    plugins: PluginChain,
    config: RegistrarConfig,
    temp_index: TempGruuIndex,
}

impl State {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Register { request, reply } => {
                            let response = self.register(&request).await;
                            let _ = reply.send(response);
                        }
                        Command::Find { aor, reply } => {
                            let contacts = self.find(&aor).await;
                            let _ = reply.send(contacts);
                        }
                        Command::FindGruu { uri, reply } => {
                            let contact = self.find_gruu(&uri).await;
                            let _ = reply.send(contact);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn register(&mut self, request: &IncomingRequest) -> SipReply {
        // 1. Authentication through the port.
        if let AuthOutcome::Challenge { code, challenge } = self.auth.check(request).await {
            let header = match code {
                StatusCode::ProxyAuthenticationRequired => {
                    Header::ProxyAuthenticate(ProxyAuthenticate::new(challenge))
                }
                _ => Header::WwwAuthenticate(WwwAuthenticate::new(challenge)),
            };
            return SipReply::new(code).with_header(header);
        }

        let opts = match self
            .plugins
            .registrar_request_opts(request, RegisterOpts::from(&self.config))
            .await
        {
            HookOutcome::Continue(opts) => opts,
            HookOutcome::ShortCircuit(reply) => return reply,
        };

        let aor_uri = request.core.to.uri().clone();
        let aor = aor_uri.aor();
        let expires_hdr = request.request.headers.expires().map(|e| e.secs());
        let contacts: Vec<&Contact> = request.request.headers.contacts().collect();

        // 2. Wildcard deregistration (RFC 3261 §10.2.2).
        if contacts.iter().any(|c| c.is_star()) {
            if contacts.len() != 1 || expires_hdr != Some(0) {
                return SipReply::new(StatusCode::BadRequest).with_reason("Invalid Contact");
            }
            for (tag, _) in self.store.list(&aor).await {
                self.temp_index.invalidate_binding(&aor, &tag);
            }
            self.store.del_aor(&aor).await;
            log::debug!("Deregistered all bindings of {aor}");
            return self.finish_reply(SipReply::new(StatusCode::Ok)).await;
        }

        // 3. Validation pass over all contacts before any mutation.
        for contact in &contacts {
            let addr = contact.addr().expect("star handled above");
            let expires = addr.expires().or(expires_hdr).unwrap_or(opts.default_expires);

            // Registering a GRUU as a contact is forbidden.
            if addr.uri().is_gruu() {
                return SipReply::new(StatusCode::Forbidden);
            }

            if expires > 0 && opts.min_expires > 0 && expires < opts.min_expires {
                return SipReply::new(StatusCode::IntervalTooBrief)
                    .with_header(Header::MinExpires(MinExpires::new(opts.min_expires)));
            }

            // RFC 5626: reg-id requires an instance and a negotiated
            // outbound path on the first hop.
            if addr.reg_id().is_some() && (addr.instance().is_none() || !opts.outbound) {
                return SipReply::new(StatusCode::FirstHopLacksOutbound)
                    .with_reason("First Hop Lacks Outbound Support");
            }
        }

        let now = Instant::now();
        let path: Vec<Uri> = request
            .request
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Path(p) => Some(p.uri().clone()),
                _ => None,
            })
            .collect();

        // 4. Apply each contact.
        for contact in &contacts {
            let addr = contact.addr().expect("star handled above");
            let expires = addr.expires().or(expires_hdr).unwrap_or(opts.default_expires);
            let instance = addr.instance();
            let reg_id = addr.reg_id();

            let instance_id: Arc<str> = match instance {
                Some(value) => {
                    let index: Arc<str> = hash_instance(value).into();
                    match self.plugins.registrar_get_index(instance, index).await {
                        HookOutcome::Continue(index) => index,
                        HookOutcome::ShortCircuit(reply) => return reply,
                    }
                }
                None => "".into(),
            };

            // Bindings are indexed by (instance, reg-id); instanceless
            // contacts fall back to their URI.
            let tag: BindingTag = if instance_id.is_empty() {
                addr.uri().to_string()
            } else {
                format!("{instance_id}/{}", reg_id.unwrap_or(0))
            };

            let existing = self.store.get(&aor, &tag).await;

            if expires == 0 {
                if existing.is_some() {
                    self.temp_index.invalidate_binding(&aor, &tag);
                    self.store.del(&aor, &tag).await;
                    log::debug!("Deregistered {tag} of {aor}");
                }
                // Deregistering an unknown binding still yields 200.
                continue;
            }

            let mut keep_temp_gruu = None;
            if let Some(existing) = &existing {
                if existing.call_id == request.core.call_id {
                    if request.core.cseq.cseq <= existing.cseq {
                        return SipReply::new(StatusCode::BadRequest).with_reason("Stale CSeq");
                    }
                    keep_temp_gruu = existing.temp_gruu.clone();
                } else if !instance_id.is_empty() {
                    // New Call-ID: every temp GRUU minted before it
                    // dies (RFC 5627 §4.2).
                    self.temp_index.invalidate_other_call_ids(
                        &aor,
                        &instance_id,
                        &request.core.call_id,
                    );
                }
            }

            let (pub_gruu, temp_gruu) = if instance_id.is_empty() {
                (None, None)
            } else {
                let pub_gruu = gruu::pub_gruu(&aor_uri, &instance_id);
                let temp_gruu = match keep_temp_gruu {
                    Some(existing) => existing,
                    None => {
                        let (opaque, uri) = gruu::temp_gruu(&aor_uri.host_port.host);
                        self.temp_index.insert(
                            opaque,
                            TempGruuEntry {
                                aor: aor.clone(),
                                tag: tag.clone(),
                                instance_id: instance_id.clone(),
                                call_id: request.core.call_id.clone(),
                            },
                        );
                        uri
                    }
                };
                (Some(pub_gruu), Some(temp_gruu))
            };

            let binding = RegContact {
                uri: addr.uri().clone(),
                expires_at: now + Duration::from_secs(expires as u64),
                registered_at: now,
                call_id: request.core.call_id.clone(),
                cseq: request.core.cseq.cseq,
                instance_id,
                reg_id,
                pub_gruu,
                temp_gruu,
                path: path.clone(),
                q: addr.q(),
            };

            log::debug!("Registered {} under {aor} for {expires}s", binding.uri);
            self.store.put(&aor, tag, binding).await;
        }

        // 5. Echo the current bindings.
        let mut reply = SipReply::new(StatusCode::Ok);
        for binding in self.find(&aor).await {
            let mut echoed =
                ContactAddr::new(SipAddr::NameAddr(NameAddr::new(binding.uri.clone())));
            echoed.set_expires(binding.expires_in(now));
            if let Some(pub_gruu) = &binding.pub_gruu {
                echoed.set_pub_gruu(pub_gruu);
            }
            if let Some(temp_gruu) = &binding.temp_gruu {
                echoed.set_temp_gruu(temp_gruu);
            }
            reply.headers.push(Header::Contact(echoed.into()));
        }

        self.finish_reply(reply).await
    }

    async fn finish_reply(&self, reply: SipReply) -> SipReply {
        match self.plugins.registrar_request_reply(reply).await {
            HookOutcome::Continue(reply) => reply,
            HookOutcome::ShortCircuit(reply) => reply,
        }
    }

    /// Live contacts, most recently registered first. Expired entries
    /// are removed on the way.
    async fn find(&mut self, aor: &str) -> Vec<RegContact> {
        let now = Instant::now();
        let mut live = Vec::new();

        for (tag, contact) in self.store.list(aor).await {
            if contact.is_expired(now) {
                self.temp_index.invalidate_binding(aor, &tag);
                self.store.del(aor, &tag).await;
            } else {
                live.push(contact);
            }
        }

        live.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        live
    }

    async fn find_gruu(&mut self, uri: &Uri) -> Option<RegContact> {
        let now = Instant::now();
        match &uri.gr_param {
            // Public GRUU: stable hash in the gr value.
            Some(Some(gr)) => {
                let aor = uri.aor();
                for (_, contact) in self.store.list(&aor).await {
                    if contact.is_expired(now) {
                        continue;
                    }
                    let matches = contact
                        .pub_gruu
                        .as_ref()
                        .and_then(|g| g.gr_param.as_ref()?.as_deref())
                        .is_some_and(|g| g == &**gr);
                    if matches {
                        return Some(contact);
                    }
                }
                None
            }
            // Temporary GRUU: opaque user part in the rolling table.
            Some(None) => {
                let opaque = uri.user.as_ref()?.user.clone();
                let entry = self.temp_index.resolve(&opaque)?.clone();
                let contact = self.store.get(&entry.aor, &entry.tag).await?;
                (!contact.is_expired(now)).then_some(contact)
            }
            None => None,
        }
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        for aor in self.store.aors().await {
            for (tag, contact) in self.store.list(&aor).await {
                if contact.is_expired(now) {
                    log::debug!("Sweeping expired binding {tag} of {aor}");
                    self.temp_index.invalidate_binding(&aor, &tag);
                    self.store.del(&aor, &tag).await;
                }
            }
        }
    }
}

fn hash_instance(instance: &str) -> String {
    let mut hasher = DefaultHasher::new();
    instance.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuth;
    use crate::headers::{CSeq, CallId, HeaderParse};
    use crate::message::SipMethod;
    use crate::transaction::mock;
    use tokio::time;

    fn registrar() -> Registrar {
        Registrar::spawn(
            Box::new(MemoryStore::new()),
            Arc::new(NoAuth),
            PluginChain::default(),
            RegistrarConfig::default(),
        )
    }

    fn register_request(contact: &str, call_id: &str, cseq: u32) -> IncomingRequest {
        let mut request = mock::request(SipMethod::Register);
        request.core.to = crate::headers::To::from_bytes(b"<sip:client1@nksip>").unwrap();
        request.core.call_id = CallId::new(call_id.to_string());
        request.core.cseq = CSeq::new(cseq, SipMethod::Register);
        request.request.headers.push(Header::Contact(
            Contact::from_bytes(contact.as_bytes()).unwrap(),
        ));
        request
    }

    fn contact_with_instance() -> &'static str {
        "<sip:client1@127.0.0.1:5070>;+sip.instance=\"<urn:uuid:u1>\""
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let registrar = registrar();
        let reply = registrar
            .register(register_request("<sip:client1@127.0.0.1:5070>", "call-1", 1))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::Ok);

        let contacts = registrar.find("sip:client1@nksip").await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].uri.to_string(), "sip:client1@127.0.0.1:5070");
    }

    #[tokio::test]
    async fn test_register_mints_gruus() {
        // Registration with an instance yields a stable pub-gruu and a
        // fresh temp-gruu, both echoed on the 200.
        let registrar = registrar();
        let reply = registrar
            .register(register_request(contact_with_instance(), "call-1", 1))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::Ok);
        let echoed = reply.headers.contacts().next().unwrap().addr().unwrap();
        let pub_gruu = echoed.params().get("pub-gruu").unwrap();
        let temp_gruu = echoed.params().get("temp-gruu").unwrap();
        assert!(pub_gruu.contains("sip:client1@nksip;gr="));
        assert!(temp_gruu.contains("@nksip;gr"));

        // The pub GRUU resolves back to the bound contact.
        let gruu_uri: Uri = pub_gruu.trim_matches('"').parse().unwrap();
        let resolved = registrar.find_gruu(&gruu_uri).await.unwrap().unwrap();
        assert_eq!(resolved.uri.to_string(), "sip:client1@127.0.0.1:5070");
    }

    #[tokio::test]
    async fn test_temp_gruu_rotation_on_call_id_change() {
        let registrar = registrar();

        let reply = registrar
            .register(register_request(contact_with_instance(), "call-1", 1))
            .await
            .unwrap();
        let first = reply.headers.contacts().next().unwrap().addr().unwrap();
        let old_temp: Uri = first
            .params()
            .get("temp-gruu")
            .unwrap()
            .trim_matches('"')
            .parse()
            .unwrap();
        let old_pub = first.params().get("pub-gruu").unwrap().to_string();

        assert!(registrar.find_gruu(&old_temp).await.unwrap().is_some());

        // Same instance re-registers with a new Call-ID.
        let reply = registrar
            .register(register_request(contact_with_instance(), "call-2", 1))
            .await
            .unwrap();
        let second = reply.headers.contacts().next().unwrap().addr().unwrap();
        let new_temp: Uri = second
            .params()
            .get("temp-gruu")
            .unwrap()
            .trim_matches('"')
            .parse()
            .unwrap();
        let new_pub = second.params().get("pub-gruu").unwrap().to_string();

        // Old temp GRUU no longer resolves; the new one does; the pub
        // GRUU is unchanged.
        assert!(registrar.find_gruu(&old_temp).await.unwrap().is_none());
        let resolved = registrar.find_gruu(&new_temp).await.unwrap().unwrap();
        assert_eq!(resolved.uri.to_string(), "sip:client1@127.0.0.1:5070");
        assert_eq!(old_pub, new_pub);
    }

    #[tokio::test]
    async fn test_replacement_keeps_insertion_order() {
        let registrar = registrar();

        registrar
            .register(register_request(contact_with_instance(), "call-1", 1))
            .await
            .unwrap();
        let reply = registrar
            .register(register_request(
                "<sip:client1@10.0.0.2:5070>;+sip.instance=\"<urn:uuid:u1>\"",
                "call-1",
                2,
            ))
            .await
            .unwrap();
        assert_eq!(reply.code, StatusCode::Ok);

        let contacts = registrar.find("sip:client1@nksip").await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].uri.to_string(), "sip:client1@10.0.0.2:5070");
        assert_eq!(contacts[0].cseq, 2);
    }

    #[tokio::test]
    async fn test_stale_cseq_rejected() {
        let registrar = registrar();

        registrar
            .register(register_request(contact_with_instance(), "call-1", 5))
            .await
            .unwrap();
        let reply = registrar
            .register(register_request(contact_with_instance(), "call-1", 4))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::BadRequest);
        assert_eq!(reply.reason_str(), "Stale CSeq");
    }

    #[tokio::test]
    async fn test_gruu_contact_forbidden() {
        let registrar = registrar();
        let reply = registrar
            .register(register_request(
                "<sip:client1@nksip;gr=abc123>",
                "call-1",
                1,
            ))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn test_reg_id_without_instance_rejected() {
        let registrar = registrar();
        let reply = registrar
            .register(register_request(
                "<sip:client1@127.0.0.1:5070>;reg-id=1",
                "call-1",
                1,
            ))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::FirstHopLacksOutbound);
    }

    #[tokio::test]
    async fn test_star_deregistration() {
        let registrar = registrar();
        registrar
            .register(register_request("<sip:client1@127.0.0.1:5070>", "call-1", 1))
            .await
            .unwrap();

        let mut request = mock::request(SipMethod::Register);
        request.core.to = crate::headers::To::from_bytes(b"<sip:client1@nksip>").unwrap();
        request.core.cseq = CSeq::new(2, SipMethod::Register);
        request
            .request
            .headers
            .push(Header::Contact(Contact::Star));
        request
            .request
            .headers
            .push(Header::Expires(crate::headers::Expires::new(0)));

        let reply = registrar.register(request).await.unwrap();
        assert_eq!(reply.code, StatusCode::Ok);
        assert_eq!(reply.headers.contacts().count(), 0);
        assert!(registrar.find("sip:client1@nksip").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_star_with_nonzero_expires_rejected() {
        let registrar = registrar();

        let mut request = mock::request(SipMethod::Register);
        request.core.to = crate::headers::To::from_bytes(b"<sip:client1@nksip>").unwrap();
        request
            .request
            .headers
            .push(Header::Contact(Contact::Star));

        let reply = registrar.register(request).await.unwrap();
        assert_eq!(reply.code, StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn test_deregister_unknown_binding_is_ok() {
        let registrar = registrar();
        let mut request = register_request("<sip:client1@127.0.0.1:5070>", "call-1", 1);
        request
            .request
            .headers
            .push(Header::Expires(crate::headers::Expires::new(0)));
        // Contact-level param wins over the header, both zero here.
        let reply = registrar.register(request).await.unwrap();

        assert_eq!(reply.code, StatusCode::Ok);
        assert_eq!(reply.headers.contacts().count(), 0);
    }

    #[tokio::test]
    async fn test_min_expires_enforced() {
        let registrar = Registrar::spawn(
            Box::new(MemoryStore::new()),
            Arc::new(NoAuth),
            PluginChain::default(),
            RegistrarConfig {
                min_expires: 120,
                ..Default::default()
            },
        );

        let reply = registrar
            .register(register_request(
                "<sip:client1@127.0.0.1:5070>;expires=30",
                "call-1",
                1,
            ))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::IntervalTooBrief);
        assert!(reply
            .headers
            .iter()
            .any(|h| matches!(h, Header::MinExpires(me) if me.secs() == 120)));
    }

    #[tokio::test]
    async fn test_challenge_passthrough() {
        let registrar = Registrar::spawn(
            Box::new(MemoryStore::new()),
            Arc::new(crate::auth::mock::AlwaysChallenge),
            PluginChain::default(),
            RegistrarConfig::default(),
        );

        let reply = registrar
            .register(register_request("<sip:client1@127.0.0.1:5070>", "call-1", 1))
            .await
            .unwrap();

        assert_eq!(reply.code, StatusCode::Unauthorized);
        assert!(reply
            .headers
            .iter()
            .any(|h| matches!(h, Header::WwwAuthenticate(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_bindings_dropped_on_read() {
        let registrar = registrar();
        registrar
            .register(register_request(
                "<sip:client1@127.0.0.1:5070>;expires=60",
                "call-1",
                1,
            ))
            .await
            .unwrap();

        assert_eq!(registrar.find("sip:client1@nksip").await.unwrap().len(), 1);

        time::sleep(Duration::from_secs(61)).await;

        assert!(registrar.find("sip:client1@nksip").await.unwrap().is_empty());
    }
}
