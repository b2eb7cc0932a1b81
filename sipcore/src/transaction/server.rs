use std::ops::Deref;

use crate::error::Result;
use crate::message::SipMethod;
use crate::transaction::{State, TransactionLayer, TsxCore};
use crate::transport::{IncomingRequest, OutgoingResponse};

/// A non-INVITE server transaction (RFC 3261 §17.2.2).
#[derive(Clone)]
pub struct ServerTransaction {
    transaction: TsxCore,
}

impl ServerTransaction {
    pub fn new(layer: &TransactionLayer, request: &IncomingRequest) -> Self {
        let method = request.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE server transaction: {method}",
        );

        let transaction = TsxCore::new_uas(request, layer, State::Trying);
        let uas = ServerTransaction { transaction };

        layer.add_server_tsx(uas.clone().into());

        uas
    }

    /// Sends a response from the TU through the transaction.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        if matches!(self.state(), State::Completed | State::Terminated) {
            log::debug!(
                "Dropping {} response, transaction already {:?}",
                response.status_code().into_u16(),
                self.state(),
            );
            return Ok(());
        }

        self.tsx_send_response(response).await?;

        if response.is_provisional() {
            self.change_state_to(State::Proceeding);
        } else {
            self.change_state_to(State::Completed);
            self.terminate();
        }

        Ok(())
    }

    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer J.
            self.schedule_termination(self.timers().timeout());
        }
    }
}

impl From<ServerTransaction> for super::ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        super::ServerTsx::NonInvite(tsx)
    }
}

impl Deref for ServerTransaction {
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

    #[tokio::test]
    async fn test_trying_to_completed() {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Register);
        let tsx = ServerTransaction::new(&layer, &request);

        assert_eq!(tsx.state(), State::Trying);

        let response = &mut mock::response(StatusCode::Ok);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.state(), State::Completed);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::Ok));
    }

    #[tokio::test]
    async fn test_provisional_moves_to_proceeding() {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Subscribe);
        let tsx = ServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::Trying);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_retransmission_reemits_cached_response() {
        // A duplicate request in Completed re-emits the cached final
        // response and causes no state change.
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Register);
        let tsx = ServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::Ok);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.retrans_count(), 0);

        let server_tsx = ServerTsx::NonInvite(tsx.clone());
        server_tsx.receive_request(&request).await.unwrap();

        assert_eq!(tsx.retrans_count(), 1);
        assert_eq!(tsx.state(), State::Completed);

        server_tsx.receive_request(&request).await.unwrap();
        assert_eq!(tsx.retrans_count(), 2);
        assert_eq!(tsx.state(), State::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_j_linger() {
        let layer = TransactionLayer::default();
        let request = mock::request(SipMethod::Register);
        let tsx = ServerTransaction::new(&layer, &request);

        let response = &mut mock::response(StatusCode::Ok);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.state(), State::Completed);

        time::sleep(tsx.timers().timeout() + Duration::from_millis(1)).await;
        assert_eq!(tsx.state(), State::Terminated);
        assert!(layer.is_empty());
    }
}
