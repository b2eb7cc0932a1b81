use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::error::Result;
use crate::headers::{self, CSeq, Header, Headers, MaxForwards};
use crate::message::{Request, RequestLine, SipMethod, Uri};
use crate::transaction::{client::ClientTransaction, State, TransactionLayer, TsxCore};
use crate::transport::{IncomingResponse, OutgoingRequest};

/// The identity of the INVITE this transaction sent, kept for building
/// the ACK and CANCEL.
struct OriginalRequest {
    uri: Uri,
    via: headers::Via,
    from: headers::From,
    to: headers::To,
    cseq: CSeq,
    call_id: headers::CallId,
}

#[derive(Default)]
struct CancelState {
    /// The TU asked for cancellation before any provisional arrived.
    pending: bool,
    /// CANCEL has been sent.
    sent: bool,
}

/// An INVITE client transaction (RFC 3261 §17.1.1).
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: TsxCore,
    request: Arc<OriginalRequest>,
    cancel: Arc<Mutex<CancelState>>,
}

impl InvClientTransaction {
    /// Sends the INVITE and starts the transaction in Calling.
    pub async fn send(
        mut request: OutgoingRequest,
        layer: &TransactionLayer,
    ) -> Result<InvClientTransaction> {
        let method = request.msg.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for client INVITE transaction: expected INVITE, got: {method}",
        );

        let transaction = TsxCore::new_uac(&request, layer, State::Calling);
        transaction.tsx_send_request(&mut request).await?;

        let headers = &request.msg.headers;
        let via = headers.via().expect("INVITE carries a Via").clone();
        let from = headers.from_hdr().expect("INVITE carries a From").clone();
        let to = headers.to_hdr().expect("INVITE carries a To").clone();
        let cseq = headers.cseq().expect("INVITE carries a CSeq").clone();
        let call_id = headers.call_id().expect("INVITE carries a Call-ID").clone();
        let uri = request.msg.req_line.uri.clone();

        let request = Arc::new(OriginalRequest {
            uri,
            via,
            from,
            to,
            cseq,
            call_id,
        });
        let uac_inv = InvClientTransaction {
            transaction,
            request,
            cancel: Default::default(),
        };

        layer.add_client_tsx(uac_inv.clone().into());

        tokio::spawn(uac_inv.clone().tsx_retrans_task());

        Ok(uac_inv)
    }

    async fn tsx_retrans_task(self) -> Result<()> {
        let timers = *self.timers();
        pin! {
            let timer_b = time::sleep(timers.tb);
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_a, if self.is_calling() => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let interval = timers.retrans_interval(retrans);
                            timer_a.set(Either::Left(time::sleep(interval)));
                        },
                        Err(err) => {
                            log::info!("Failed to retransmit: {err}");
                        },
                    }
                }
                _ = &mut timer_b, if self.is_calling() => {
                    // Timer B expired without a final response.
                    self.notify_timeout();
                    self.on_terminated();
                    break 'retrans Ok(());
                }
                else => break 'retrans Ok(()),
            }
        }
    }

    /// Advances the FSM on a response. Returns `true` when the
    /// response was absorbed and must not reach the TU.
    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.response.code();
        self.set_last_status_code(code);

        match self.state() {
            State::Calling if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                self.flush_pending_cancel().await?;
            }
            State::Proceeding if code.is_provisional() => (),
            State::Calling | State::Proceeding if matches!(code.into_u16(), 300..=699) => {
                self.change_state_to(State::Completed);
                let mut ack = self.create_ack(response);

                self.tsx_send_request(&mut ack).await?;
                self.terminate();
            }
            State::Calling | State::Proceeding if code.is_final() => {
                // 2xx: the transaction ends here; the ACK belongs to
                // the TU (RFC 3261 §13.2.2.4).
                self.on_terminated();
            }
            State::Completed => {
                // 17.1.1.2: retransmissions of the final response
                // re-trigger the ACK but must not reach the TU.
                self.retransmit().await?;
                return Ok(true);
            }
            _ => (),
        }
        Ok(false)
    }

    /// Cancels the pending INVITE. CANCEL is only sent once a
    /// provisional response has been received; before that the request
    /// is recorded and fired on the first 1xx (RFC 3261 §9.1).
    pub(crate) async fn send_cancel(&self) -> Result<()> {
        {
            let mut cancel = self.cancel.lock().expect("Lock failed");
            if cancel.sent {
                return Ok(());
            }
            match self.state() {
                State::Calling => {
                    cancel.pending = true;
                    return Ok(());
                }
                State::Proceeding => {
                    cancel.sent = true;
                }
                // Already completed; nothing to cancel.
                _ => return Ok(()),
            }
        }
        self.do_send_cancel().await
    }

    async fn flush_pending_cancel(&self) -> Result<()> {
        let fire = {
            let mut cancel = self.cancel.lock().expect("Lock failed");
            if cancel.pending && !cancel.sent {
                cancel.pending = false;
                cancel.sent = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.do_send_cancel().await?;
        }
        Ok(())
    }

    async fn do_send_cancel(&self) -> Result<()> {
        let original = &self.request;
        let mut headers = Headers::with_capacity(6);

        // Same branch as the INVITE; own (branch, CANCEL) transaction.
        headers.push(Header::Via(original.via.clone()));
        headers.push(Header::From(original.from.clone()));
        headers.push(Header::To(original.to.clone()));
        headers.push(Header::CallId(original.call_id.clone()));
        headers.push(Header::CSeq(CSeq {
            method: SipMethod::Cancel,
            ..original.cseq.clone()
        }));
        headers.push(Header::MaxForwards(MaxForwards::default()));

        let cancel = OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Cancel,
                    uri: original.uri.clone(),
                },
                headers,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        };

        ClientTransaction::send(cancel, self.layer()).await?;
        Ok(())
    }

    /// Cancellation has been requested but not yet fired.
    pub(crate) fn cancel_pending(&self) -> bool {
        self.cancel.lock().expect("Lock failed").pending
    }

    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response
            .response
            .headers
            .to_hdr()
            .unwrap_or(&self.request.to)
            .clone();
        let cseq = CSeq {
            method: SipMethod::Ack,
            ..self.request.cseq.clone()
        };

        let original = &self.request;
        let mut ack_hdrs = Headers::with_capacity(5);

        ack_hdrs.push(Header::Via(original.via.clone()));
        ack_hdrs.push(Header::From(original.from.clone()));
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(original.call_id.clone()));
        ack_hdrs.push(Header::CSeq(cseq));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: self.request.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        }
    }

    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer D.
            self.schedule_termination(self.timers().timer_d());
        }
    }
}

impl From<InvClientTransaction> for super::ClientTsx {
    fn from(tsx: InvClientTransaction) -> Self {
        super::ClientTsx::Invite(tsx)
    }
}

impl DerefMut for InvClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for InvClientTransaction {
    type Target = TsxCore;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_state_calling() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();

        assert_eq!(uac_inv.state(), State::Calling);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_invite_response(StatusCode::Trying);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_state_completed() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_invite_response(StatusCode::BusyHere);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::BusyHere));
        assert_eq!(uac_inv.state(), State::Completed);
    }

    #[tokio::test]
    async fn test_2xx_terminates() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_invite_response(StatusCode::Ok);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();
        let absorbed = uac_inv.receive(&response).await.unwrap();

        assert!(!absorbed);
        assert_eq!(uac_inv.state(), State::Terminated);
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_deferred_until_provisional() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();

        uac_inv.send_cancel().await.unwrap();
        assert!(uac_inv.cancel_pending());

        let response = mock::incoming_invite_response(StatusCode::Ringing);
        uac_inv.receive(&response).await.unwrap();

        // The pending CANCEL fired and created its own transaction.
        assert!(!uac_inv.cancel_pending());
        let cancel_key = crate::transaction::TsxKey::create_client_with(
            &SipMethod::Cancel,
            uac_inv.key().branch().unwrap().into(),
        );
        assert!(layer.find_client_tsx(&cancel_key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();

        assert!(uac_inv.retrans_count() == 0);
        assert_eq!(uac_inv.state(), State::Calling);

        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac_inv.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 4);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();

        assert_eq!(uac_inv.state(), State::Calling);

        time::sleep(uac_inv.timers().tb + Duration::from_millis(1)).await;

        assert!(uac_inv.state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_invite_response(StatusCode::BusyHere);

        let uac_inv = InvClientTransaction::send(request, &layer).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.state(), State::Completed);

        time::sleep(uac_inv.timers().timer_d() + Duration::from_millis(1)).await;

        assert!(uac_inv.state() == State::Terminated);
    }
}
