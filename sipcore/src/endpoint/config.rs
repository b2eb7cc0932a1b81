//! Endpoint configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::message::{SipAddr, TransportKind};
use crate::registrar::RegistrarConfig;
use crate::transaction::TimerConfig;

/// The closed configuration of an endpoint.
///
/// There is no open key/value bag: an option the stack does not know
/// cannot be expressed, so misconfiguration fails at build time rather
/// than being discovered at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// The endpoint name used in logs.
    pub name: String,
    /// Address/transport tuples to bind.
    pub listen: Vec<(SocketAddr, TransportKind)>,
    /// Default From for locally generated requests.
    pub from: Option<SipAddr>,
    /// Host written into Via and Contact headers. Defaults to the
    /// transport's local address.
    pub local_host: Option<String>,
    /// Emit deep-debug trace records.
    pub debug: bool,
    /// Transaction timer bases (T1, T2, T4, timer B, timer C).
    pub timers: TimerConfig,
    /// How long an idle call process lingers before exiting.
    pub call_linger: Duration,
    /// Registrar behavior, when one is attached.
    pub registrar: RegistrarConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: String::new(),
            listen: Vec::new(),
            from: None,
            local_host: None,
            debug: false,
            timers: TimerConfig::default(),
            call_linger: Duration::from_secs(5),
            registrar: RegistrarConfig::default(),
        }
    }
}
