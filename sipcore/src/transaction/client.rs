use std::ops::{Deref, DerefMut};

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::error::Result;
use crate::message::SipMethod;
use crate::transaction::{State, TransactionLayer, TsxCore};
use crate::transport::{IncomingResponse, OutgoingRequest};

/// A non-INVITE client transaction (RFC 3261 §17.1.2).
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: TsxCore,
}

impl ClientTransaction {
    /// Sends the request and starts the transaction in Trying.
    pub async fn send(
        mut request: OutgoingRequest,
        layer: &TransactionLayer,
    ) -> Result<ClientTransaction> {
        let method = request.msg.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE client transaction: {method}",
        );

        let transaction = TsxCore::new_uac(&request, layer, State::Trying);
        transaction.tsx_send_request(&mut request).await?;

        let uac = ClientTransaction { transaction };

        layer.add_client_tsx(uac.clone().into());

        tokio::spawn(uac.clone().tsx_retrans_task());

        Ok(uac)
    }

    async fn tsx_retrans_task(self) -> Result<()> {
        let timers = *self.timers();
        pin! {
            let timer_f = time::sleep(timers.timeout());
            let timer_e = if !self.reliable() {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_e, if self.is_running() => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            // In Proceeding retransmissions continue at T2.
                            let interval = if self.state() == State::Proceeding {
                                timers.t2
                            } else {
                                timers.retrans_interval(retrans)
                            };
                            timer_e.set(Either::Left(time::sleep(interval)));
                        },
                        Err(err) => {
                            log::info!("Failed to retransmit: {err}");
                        },
                    }
                }
                _ = &mut timer_f, if self.is_running() => {
                    // Timer F expired without a final response.
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
            State::Trying | State::Proceeding if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding => {
                self.change_state_to(State::Completed);
                self.terminate();
            }
            State::Completed => {
                // Final-response retransmissions are absorbed here.
                return Ok(true);
            }
            _ => (),
        }
        Ok(false)
    }

    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer K.
            self.schedule_termination(self.timers().t4);
        }
    }
}

impl From<ClientTransaction> for super::ClientTsx {
    fn from(tsx: ClientTransaction) -> Self {
        super::ClientTsx::NonInvite(tsx)
    }
}

impl DerefMut for ClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ClientTransaction {
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
    async fn test_state_trying() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();

        assert_eq!(uac.state(), State::Trying);
    }

    #[tokio::test]
    async fn test_state_proceeding_then_completed() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();

        uac.receive(&mock::incoming_response(StatusCode::Trying)).await.unwrap();
        assert_eq!(uac.state(), State::Proceeding);

        uac.receive(&mock::incoming_response(StatusCode::Ok)).await.unwrap();
        assert_eq!(uac.state(), State::Completed);
        assert_eq!(uac.last_status_code(), Some(StatusCode::Ok));
    }

    #[tokio::test]
    async fn test_final_retransmission_absorbed() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();

        let first = uac.receive(&mock::incoming_response(StatusCode::Ok)).await.unwrap();
        assert!(!first);

        let duplicate = uac.receive(&mock::incoming_response(StatusCode::Ok)).await.unwrap();
        assert!(duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_e_retransmits() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();

        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_f_times_out() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();

        time::sleep(uac.timers().timeout() + Duration::from_millis(1)).await;
        assert_eq!(uac.state(), State::Terminated);
        assert!(layer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_k_linger() {
        let layer = TransactionLayer::default();
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &layer).await.unwrap();
        uac.receive(&mock::incoming_response(StatusCode::Ok)).await.unwrap();

        assert_eq!(uac.state(), State::Completed);

        time::sleep(uac.timers().t4 + Duration::from_millis(1)).await;
        assert_eq!(uac.state(), State::Terminated);
    }
}
