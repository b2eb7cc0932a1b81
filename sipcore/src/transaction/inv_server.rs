use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::sync::oneshot;
use tokio::{pin, time};

use crate::error::Result;
use crate::message::SipMethod;
use crate::transaction::{State, TransactionLayer, TsxCore};
use crate::transport::{IncomingRequest, OutgoingResponse};

type TxConfirmed = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxConfirmed = oneshot::Receiver<()>;

/// An INVITE server transaction (RFC 3261 §17.2.1).
///
/// Enters Proceeding on arrival. A 2xx from the TU terminates it (2xx
/// retransmission belongs to the TU); a 3xx-6xx moves it to Completed,
/// retransmitting until the ACK confirms.
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: TsxCore,
    tx_confirmed: TxConfirmed,
}

impl InvServerTransaction {
    pub fn new(layer: &TransactionLayer, request: &IncomingRequest) -> Self {
        let method = request.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Expected INVITE for server INVITE transaction, got: {method}",
        );

        let transaction = TsxCore::new_uas(request, layer, State::Proceeding);
        let tx_confirmed = Default::default();

        let uas_inv = InvServerTransaction {
            transaction,
            tx_confirmed,
        };

        layer.add_server_tsx(uas_inv.clone().into());

        uas_inv
    }

    /// Sends a response from the TU through the transaction.
    ///
    /// Once a final response has been sent the transaction refuses
    /// further ones; in particular a 2xx after the 487 of a CANCEL is
    /// dropped here.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        if !matches!(self.state(), State::Proceeding) {
            log::debug!(
                "Dropping {} response, transaction already {:?}",
                response.status_code().into_u16(),
                self.state(),
            );
            return Ok(());
        }

        self.tsx_send_response(response).await?;

        let code = response.status_code().into_u16();

        match code {
            100..=199 => {
                // Still Proceeding; the response is cached for
                // retransmission absorption.
            }
            200..=299 => {
                // The TU owns 2xx retransmissions and the ACK.
                self.on_terminated();
            }
            300..=699 => {
                self.change_state_to(State::Completed);

                let (tx, rx) = oneshot::channel();
                self.tx_confirmed.lock().expect("Lock failed").replace(tx);
                self.initiate_retransmission(rx);
            }
            _ => (),
        };

        Ok(())
    }

    /// The ACK arrived: Completed → Confirmed, then timer I linger.
    pub(crate) fn on_ack(&self) {
        self.change_state_to(State::Confirmed);
        let mut lock = self.tx_confirmed.lock().expect("Lock failed");
        if let Some(sender) = lock.take() {
            let _ = sender.send(());
        }
        drop(lock);
        self.terminate();
    }

    fn initiate_retransmission(&self, mut rx_confirmed: RxConfirmed) {
        let unreliable = !self.reliable();
        let uas = self.clone();

        tokio::spawn(async move {
            let timers = *uas.timers();
            let timer_h = time::sleep(timers.timeout());
            let timer_g = if unreliable {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };

            pin!(timer_h);
            pin!(timer_g);

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_g => {
                        match uas.retransmit().await {
                            Ok(retrans) => {
                                let interval = timers.retrans_interval(retrans);
                                timer_g.set(Either::Left(time::sleep(interval)));
                            },
                            Err(err) => {
                                log::info!("Failed to retransmit: {err}");
                            },
                        }
                    },
                    _ = &mut timer_h => {
                        // Timer H expired: the ACK never came.
                        uas.on_terminated();
                        break 'retrans;
                    }
                    _ = &mut rx_confirmed => {
                        // Confirmed; timer I takes over.
                        break 'retrans;
                    }
                }
            }
        });
    }

    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer I.
            self.schedule_termination(self.timers().t4);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TsxCore;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::{mock, ServerTsx};
    use tokio::time::{self, Duration};

    fn tsx_uas_params() -> (TransactionLayer, IncomingRequest) {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Invite);

        (layer, request)
    }

    #[tokio::test]
    async fn test_receives_100_trying() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);
        let response = &mut mock::response(StatusCode::Trying);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().into_u16() == 100);
        assert!(tsx.state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_180_ringing() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);
        let response = &mut mock::response(StatusCode::Trying);

        tsx.respond(response).await.unwrap();
        assert!(tsx.last_status_code().unwrap().into_u16() == 100);

        let response = &mut mock::response(StatusCode::Ringing);
        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().into_u16() == 180);
        assert!(tsx.state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_2xx_terminates() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::Ok);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.state(), State::Terminated);
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_no_final_after_final() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::RequestTerminated);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.state(), State::Completed);

        // A 2xx offered by the TU after the 487 must not go out.
        let late = &mut mock::response(StatusCode::Ok);
        tsx.respond(late).await.unwrap();

        assert_eq!(tsx.last_status_code(), Some(StatusCode::RequestTerminated));
        assert_eq!(tsx.state(), State::Completed);
    }

    #[tokio::test]
    async fn test_ack_confirms() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::BusyHere);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.state(), State::Completed);

        let ack = mock::request(SipMethod::Ack);
        let server_tsx = ServerTsx::Invite(tsx.clone());
        server_tsx.receive_request(&ack).await.unwrap();

        assert_eq!(tsx.state(), State::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_timer_g_retransmission() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::BusyHere);
        tsx.respond(response).await.unwrap();

        time::sleep(tsx.timers().t1 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 1);

        time::sleep(tsx.timers().t1 * 2 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_h_expiration() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::BusyHere);
        tsx.respond(response).await.unwrap();

        time::sleep(tsx.timers().timeout() + Duration::from_millis(1)).await;
        assert!(tsx.state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_i_linger_after_ack() {
        let (layer, request) = tsx_uas_params();
        let tsx = InvServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::BusyHere);
        tsx.respond(response).await.unwrap();
        tsx.on_ack();
        assert_eq!(tsx.state(), State::Confirmed);

        time::sleep(tsx.timers().t4 + Duration::from_millis(1)).await;
        assert_eq!(tsx.state(), State::Terminated);
    }
}
