//! SIP dialog engine.
//!
//! Dialogs are identified per RFC 3261 §12 by Call-ID plus the tag
//! pair, created on a dialog-creating 1xx-with-tag or 2xx response,
//! and owned by the call process of their Call-ID.
//!
//! ```text
//! UAC (Caller)                 UAS (Receiver)
//!     |--- INVITE ----------->|
//!     |<--- 180 Ringing ------|    // early dialog
//!     |<--- 200 OK -----------|    // dialog confirmed
//!     |--- ACK -------------->|
//!     |--- BYE -------------->|    // dialog terminated
//!     |<--- 200 OK -----------|
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::headers::CallId;
use crate::message::{SipMethod, Uri};
use crate::transaction::Role;
use crate::transport::{IncomingRequest, IncomingResponse};

/// Unique identifier of a SIP dialog: Call-ID plus the local and
/// remote tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: CallId,
    pub local_tag: Arc<str>,
    pub remote_tag: Arc<str>,
}

impl DialogId {
    /// The dialog id an in-dialog request addresses at the UAS:
    /// local tag is the To tag, remote tag the From tag.
    pub fn from_incoming_request(request: &IncomingRequest) -> Option<Self> {
        let local_tag = request.core.to.tag()?;
        let remote_tag = request.core.from.tag()?;

        Some(Self {
            call_id: request.core.call_id.clone(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        })
    }

    /// The dialog id a response creates or addresses at the UAC:
    /// local tag is the From tag, remote tag the To tag.
    pub fn from_incoming_response(response: &IncomingResponse) -> Option<Self> {
        let local_tag = response.core.from.tag()?;
        let remote_tag = response.core.to.tag()?;

        Some(Self {
            call_id: response.core.call_id.clone(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        })
    }
}

/// The lifecycle states of a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Created by a provisional response carrying a remote tag.
    Early,
    /// Established by a 2xx.
    Confirmed,
    /// Ended by BYE or a terminal error.
    Terminated,
}

/// A subscription usage living inside a dialog (RFC 6665).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event: Arc<str>,
    pub id: Option<Arc<str>>,
    /// Remaining lifetime as last negotiated, in seconds.
    pub expires: Option<u32>,
}

/// A SIP dialog.
#[derive(Debug)]
pub struct Dialog {
    id: DialogId,
    role: Role,
    state: DialogState,
    /// Next CSeq to send.
    local_seq: u32,
    /// Last CSeq received.
    remote_seq: u32,
    local_uri: Uri,
    remote_uri: Uri,
    /// Where in-dialog requests go; refreshed by target-refresh
    /// requests whose Contact differs.
    remote_target: Option<Uri>,
    /// Record-Route URIs: reversed for the UAC, as recorded for the UAS.
    route_set: Vec<Uri>,
    secure: bool,
    /// Dialog was created by INVITE and lives until BYE.
    invite_usage: bool,
    subscriptions: Vec<Subscription>,
}

impl Dialog {
    /// Creates the UAS side of a dialog from the incoming request and
    /// the local tag placed in the response.
    pub fn new_uas(request: &IncomingRequest, local_tag: Arc<str>) -> Option<Dialog> {
        let method = request.method();
        if !method.can_establish_a_dialog() {
            return None;
        }
        let remote_tag: Arc<str> = request.core.from.tag()?.into();

        // RFC 3261 §12.1.1: the UAS keeps the recorded order.
        let route_set = request
            .request
            .headers
            .record_routes()
            .map(|rr| rr.uri().clone())
            .collect();

        let remote_target = request
            .request
            .headers
            .contacts()
            .find_map(|c| c.addr().map(|a| a.uri().clone()));

        let secure = request.transport.secure()
            && request.request.uri().scheme == crate::message::Scheme::Sips;

        Some(Dialog {
            id: DialogId {
                call_id: request.core.call_id.clone(),
                local_tag,
                remote_tag,
            },
            role: Role::Uas,
            state: DialogState::Early,
            local_seq: 0,
            remote_seq: request.core.cseq.cseq,
            local_uri: request.core.to.uri().clone(),
            remote_uri: request.core.from.uri().clone(),
            remote_target,
            route_set,
            secure,
            invite_usage: method.is_invite(),
            subscriptions: Vec::new(),
        })
    }

    /// Creates the UAC side of a dialog from a dialog-creating
    /// response (1xx with tag or 2xx).
    pub fn new_uac(response: &IncomingResponse) -> Option<Dialog> {
        let id = DialogId::from_incoming_response(response)?;
        let code = response.code();

        let state = if code.is_provisional() {
            DialogState::Early
        } else if code.class() == 2 {
            DialogState::Confirmed
        } else {
            return None;
        };

        // RFC 3261 §12.1.2: the UAC reverses the recorded order.
        let route_set: Vec<Uri> = response
            .response
            .headers
            .record_routes()
            .map(|rr| rr.uri().clone())
            .rev()
            .collect();

        let remote_target = response
            .response
            .headers
            .contacts()
            .find_map(|c| c.addr().map(|a| a.uri().clone()));

        let secure = response.transport.secure();

        Some(Dialog {
            id,
            role: Role::Uac,
            state,
            local_seq: response.core.cseq.cseq,
            remote_seq: 0,
            local_uri: response.core.from.uri().clone(),
            remote_uri: response.core.to.uri().clone(),
            remote_target,
            route_set,
            secure,
            invite_usage: response.core.cseq.method().is_invite(),
            subscriptions: Vec::new(),
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn route_set(&self) -> &[Uri] {
        &self.route_set
    }

    pub fn remote_target(&self) -> Option<&Uri> {
        self.remote_target.as_ref()
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &Uri {
        &self.remote_uri
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq
    }

    /// The next local CSeq number.
    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Confirms an early dialog on a 2xx.
    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    /// Applies a later response for the same dialog (2xx after 1xx,
    /// target refresh via response Contact).
    pub fn on_response(&mut self, response: &IncomingResponse) {
        if response.code().class() == 2 {
            self.confirm();
        }
        if let Some(contact) = response
            .response
            .headers
            .contacts()
            .find_map(|c| c.addr().map(|a| a.uri().clone()))
        {
            self.remote_target = Some(contact);
        }
    }

    /// Applies an in-dialog request: CSeq bookkeeping, target refresh,
    /// BYE termination, and subscription maintenance. Returns `false`
    /// when the request is stale (CSeq lower than already seen).
    pub fn on_request(&mut self, request: &IncomingRequest) -> bool {
        let cseq = request.core.cseq.cseq;
        if self.remote_seq != 0 && cseq < self.remote_seq {
            return false;
        }
        self.remote_seq = cseq;

        match request.method() {
            SipMethod::Bye => {
                self.state = DialogState::Terminated;
            }
            SipMethod::Invite | SipMethod::Update | SipMethod::Subscribe | SipMethod::Refer
            | SipMethod::Notify => {
                // Target refresh when the Contact differs.
                if let Some(contact) = request
                    .request
                    .headers
                    .contacts()
                    .find_map(|c| c.addr().map(|a| a.uri().clone()))
                {
                    if self.remote_target.as_ref() != Some(&contact) {
                        self.remote_target = Some(contact);
                    }
                }
            }
            _ => (),
        }

        if let SipMethod::Subscribe | SipMethod::Notify = request.method() {
            self.apply_subscription(request);
        }

        true
    }

    fn apply_subscription(&mut self, request: &IncomingRequest) {
        let Some(event) = request.request.headers.event() else {
            return;
        };
        let (event_name, id) = event.usage_key();

        let terminated = request
            .request
            .headers
            .subscription_state()
            .is_some_and(|ss| ss.is_terminated());

        let position = self
            .subscriptions
            .iter()
            .position(|s| s.event == event_name && s.id == id);

        if terminated {
            if let Some(position) = position {
                self.subscriptions.remove(position);
            }
            // A dialog kept alive only by subscriptions dies with the
            // last one.
            if self.subscriptions.is_empty() && !self.invite_usage {
                self.state = DialogState::Terminated;
            }
            return;
        }

        let expires = request
            .request
            .headers
            .subscription_state()
            .and_then(|ss| ss.expires())
            .or_else(|| request.request.headers.expires().map(|e| e.secs()));

        match position {
            Some(position) => self.subscriptions[position].expires = expires,
            None => self.subscriptions.push(Subscription {
                event: event_name,
                id,
                expires,
            }),
        }
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }
}

/// The dialogs of one call.
#[derive(Default)]
pub struct DialogSet {
    dialogs: HashMap<DialogId, Dialog>,
}

impl DialogSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn get(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn get_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.get_mut(id)
    }

    pub fn insert(&mut self, dialog: Dialog) {
        self.dialogs.insert(dialog.id().clone(), dialog);
    }

    pub fn remove(&mut self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.remove(id)
    }

    /// Creates or updates the UAC-side dialog for a dialog-creating
    /// response. Terminated dialogs are purged on the way.
    pub fn uac_on_response(&mut self, response: &IncomingResponse) {
        if !response.core.cseq.method().can_establish_a_dialog() {
            return;
        }
        let Some(id) = DialogId::from_incoming_response(response) else {
            return;
        };

        match self.dialogs.get_mut(&id) {
            Some(dialog) => dialog.on_response(response),
            None => {
                if let Some(dialog) = Dialog::new_uac(response) {
                    log::debug!("Dialog created (UAC) {:?}", dialog.id());
                    self.dialogs.insert(id, dialog);
                }
            }
        }
    }

    /// Routes an in-dialog request to its dialog. Returns `true` when
    /// a dialog existed and accepted it.
    pub fn on_request(&mut self, request: &IncomingRequest) -> bool {
        let Some(id) = DialogId::from_incoming_request(request) else {
            return false;
        };
        let Some(dialog) = self.dialogs.get_mut(&id) else {
            return false;
        };

        let accepted = dialog.on_request(request);
        if dialog.is_terminated() {
            log::debug!("Dialog terminated {:?}", dialog.id());
            self.dialogs.remove(&id);
        }
        accepted
    }

    /// Drops every terminated dialog.
    pub fn purge(&mut self) {
        self.dialogs.retain(|_, dialog| !dialog.is_terminated());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;

    fn invite_response(code: StatusCode) -> IncomingResponse {
        let mut response = mock::incoming_response(code);
        response.core.cseq = crate::headers::CSeq::new(1, SipMethod::Invite);
        if let Some(to) = response.response.headers.to_hdr_mut() {
            to.set_tag("remote-tag");
        }
        response.core.to.set_tag("remote-tag");
        response
    }

    #[test]
    fn test_uac_dialog_created_on_early_response() {
        let mut dialogs = DialogSet::new();
        let response = invite_response(StatusCode::Ringing);

        dialogs.uac_on_response(&response);

        assert_eq!(dialogs.len(), 1);
        let id = DialogId::from_incoming_response(&response).unwrap();
        assert_eq!(dialogs.get(&id).unwrap().state(), DialogState::Early);
    }

    #[test]
    fn test_uac_dialog_confirmed_on_2xx() {
        let mut dialogs = DialogSet::new();

        dialogs.uac_on_response(&invite_response(StatusCode::Ringing));
        let response = invite_response(StatusCode::Ok);
        dialogs.uac_on_response(&response);

        assert_eq!(dialogs.len(), 1);
        let id = DialogId::from_incoming_response(&response).unwrap();
        assert_eq!(dialogs.get(&id).unwrap().state(), DialogState::Confirmed);
    }

    #[test]
    fn test_response_without_to_tag_creates_nothing() {
        let mut dialogs = DialogSet::new();
        let mut response = mock::incoming_response(StatusCode::Ringing);
        response.core.cseq = crate::headers::CSeq::new(1, SipMethod::Invite);

        dialogs.uac_on_response(&response);
        assert!(dialogs.is_empty());
    }

    #[test]
    fn test_bye_terminates_dialog() {
        let mut dialogs = DialogSet::new();
        dialogs.uac_on_response(&invite_response(StatusCode::Ok));
        assert_eq!(dialogs.len(), 1);

        // The BYE arrives at us acting as UAS of the in-dialog request:
        // its From tag is the peer's (remote), To tag ours (local).
        let mut bye = mock::request(SipMethod::Bye);
        bye.core.from.set_tag("remote-tag");
        bye.core.to.set_tag("293nqn2");
        bye.core.cseq = crate::headers::CSeq::new(2, SipMethod::Bye);

        // Our UAC dialog has local=from-tag of the INVITE.
        let accepted = dialogs.on_request(&bye);
        assert!(accepted);
        assert!(dialogs.is_empty());
    }

    #[test]
    fn test_uas_route_set_keeps_recorded_order() {
        let mut request = mock::request(SipMethod::Invite);
        request.request.headers.push(crate::headers::Header::RecordRoute(
            crate::headers::HeaderParse::from_bytes(b"<sip:p1.example.com;lr>").unwrap(),
        ));
        request.request.headers.push(crate::headers::Header::RecordRoute(
            crate::headers::HeaderParse::from_bytes(b"<sip:p2.example.com;lr>").unwrap(),
        ));

        let dialog = Dialog::new_uas(&request, "local-tag".into()).unwrap();
        let hosts: Vec<String> = dialog
            .route_set()
            .iter()
            .map(|uri| uri.host_port.host.to_string())
            .collect();
        assert_eq!(hosts, ["p1.example.com", "p2.example.com"]);
    }

    #[test]
    fn test_uac_route_set_is_reversed() {
        let mut response = invite_response(StatusCode::Ok);
        response.response.headers.push(crate::headers::Header::RecordRoute(
            crate::headers::HeaderParse::from_bytes(b"<sip:p1.example.com;lr>").unwrap(),
        ));
        response.response.headers.push(crate::headers::Header::RecordRoute(
            crate::headers::HeaderParse::from_bytes(b"<sip:p2.example.com;lr>").unwrap(),
        ));

        let dialog = Dialog::new_uac(&response).unwrap();
        let hosts: Vec<String> = dialog
            .route_set()
            .iter()
            .map(|uri| uri.host_port.host.to_string())
            .collect();
        assert_eq!(hosts, ["p2.example.com", "p1.example.com"]);
    }

    #[test]
    fn test_target_refresh_on_in_dialog_request() {
        let mut dialogs = DialogSet::new();
        dialogs.uac_on_response(&invite_response(StatusCode::Ok));

        let mut update = mock::request(SipMethod::Update);
        update.core.from.set_tag("remote-tag");
        update.core.to.set_tag("293nqn2");
        update.core.cseq = crate::headers::CSeq::new(2, SipMethod::Update);
        update.request.headers.push(crate::headers::Header::Contact(
            crate::headers::HeaderParse::from_bytes(b"<sip:new-target@192.0.2.9:5080>").unwrap(),
        ));

        assert!(dialogs.on_request(&update));

        let id = DialogId {
            call_id: update.core.call_id.clone(),
            local_tag: "293nqn2".into(),
            remote_tag: "remote-tag".into(),
        };
        let dialog = dialogs.get(&id).unwrap();
        assert_eq!(
            dialog.remote_target().unwrap().to_string(),
            "sip:new-target@192.0.2.9:5080"
        );
    }

    #[test]
    fn test_stale_cseq_rejected() {
        let mut dialogs = DialogSet::new();
        dialogs.uac_on_response(&invite_response(StatusCode::Ok));

        let mut update = mock::request(SipMethod::Update);
        update.core.from.set_tag("remote-tag");
        update.core.to.set_tag("293nqn2");
        update.core.cseq = crate::headers::CSeq::new(9, SipMethod::Update);
        assert!(dialogs.on_request(&update));

        let mut stale = mock::request(SipMethod::Update);
        stale.core.from.set_tag("remote-tag");
        stale.core.to.set_tag("293nqn2");
        stale.core.cseq = crate::headers::CSeq::new(3, SipMethod::Update);
        assert!(!dialogs.on_request(&stale));
    }

    #[test]
    fn test_subscription_children() {
        let mut dialogs = DialogSet::new();
        dialogs.uac_on_response(&invite_response(StatusCode::Ok));

        let id = DialogId {
            call_id: mock::request(SipMethod::Invite).core.call_id.clone(),
            local_tag: "293nqn2".into(),
            remote_tag: "remote-tag".into(),
        };

        let mut notify = mock::request(SipMethod::Notify);
        notify.core.from.set_tag("remote-tag");
        notify.core.to.set_tag("293nqn2");
        notify.core.cseq = crate::headers::CSeq::new(2, SipMethod::Notify);
        notify.request.headers.push(crate::headers::Header::Event(
            crate::headers::HeaderParse::from_bytes(b"presence;id=7").unwrap(),
        ));
        notify.request.headers.push(crate::headers::Header::SubscriptionState(
            crate::headers::HeaderParse::from_bytes(b"active;expires=600").unwrap(),
        ));

        assert!(dialogs.on_request(&notify));
        assert_eq!(dialogs.get(&id).unwrap().subscriptions().len(), 1);

        let mut terminate = mock::request(SipMethod::Notify);
        terminate.core.from.set_tag("remote-tag");
        terminate.core.to.set_tag("293nqn2");
        terminate.core.cseq = crate::headers::CSeq::new(3, SipMethod::Notify);
        terminate.request.headers.push(crate::headers::Header::Event(
            crate::headers::HeaderParse::from_bytes(b"presence;id=7").unwrap(),
        ));
        terminate.request.headers.push(crate::headers::Header::SubscriptionState(
            crate::headers::HeaderParse::from_bytes(b"terminated;reason=timeout").unwrap(),
        ));

        dialogs.on_request(&terminate);
        // The INVITE usage keeps the dialog alive without children.
        let dialog = dialogs.get(&id).unwrap();
        assert!(dialog.subscriptions().is_empty());
        assert_eq!(dialog.state(), DialogState::Confirmed);
    }
}
