//! The authenticator port.
//!
//! Digest computation and credential storage live outside the core;
//! the call process consults [`Authenticator::check`] before routing
//! and turns a challenge into the matching 401/407.

use std::sync::Arc;

use crate::message::StatusCode;
use crate::transport::IncomingRequest;

/// The outcome of an authentication check.
pub enum AuthOutcome {
    /// The request is acceptable.
    Ok,
    /// The request must be challenged.
    Challenge {
        /// 401 (UAS) or 407 (proxy).
        code: StatusCode,
        /// The challenge text for the matching authenticate header.
        challenge: Arc<str>,
    },
}

/// The authenticator port consumed by the registrar and UAS chain.
#[async_trait::async_trait]
pub trait Authenticator: Sync + Send + 'static {
    /// Checks a request, returning [`AuthOutcome::Challenge`] when it
    /// must be rejected with 401/407.
    async fn check(&self, request: &IncomingRequest) -> AuthOutcome;
}

/// Accepts everything; the default when no authenticator is plugged.
pub struct NoAuth;

#[async_trait::async_trait]
impl Authenticator for NoAuth {
    async fn check(&self, _request: &IncomingRequest) -> AuthOutcome {
        AuthOutcome::Ok
    }
}
