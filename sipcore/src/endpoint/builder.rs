//! Endpoint builder.

use std::net::SocketAddr;
use std::sync::Arc;

use itertools::Itertools;

use crate::auth::{Authenticator, NoAuth};
use crate::endpoint::{Config, Endpoint, Inner};
use crate::plugin::{Plugin, PluginChain};
use crate::registrar::{MemoryStore, RegStore, Registrar};
use crate::router::{Application, DefaultApplication};
use crate::transaction::TimerConfig;
use crate::transport::udp::UdpStartup;
use crate::transport::{TransportLayer, TransportStartup};

/// Builder for a SIP [`Endpoint`].
pub struct Builder {
    config: Config,
    transport: TransportLayer,
    application: Option<Arc<dyn Application>>,
    authenticator: Arc<dyn Authenticator>,
    plugins: Vec<Box<dyn Plugin>>,
    registrar_store: Option<Box<dyn RegStore>>,
    transport_start: Vec<Box<dyn TransportStartup>>,
}

impl Builder {
    /// Creates a default `Builder`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use sipcore::endpoint;
    /// # async fn build() {
    /// let endpoint = endpoint::Builder::new().with_name("My Endpoint").build().await;
    /// # }
    /// ```
    pub fn new() -> Self {
        Builder {
            config: Config::default(),
            transport: TransportLayer::new(),
            application: None,
            authenticator: Arc::new(NoAuth),
            plugins: vec![],
            registrar_store: None,
            transport_start: vec![],
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.config.name = s.as_ref().to_string();
        self
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Overrides the transaction timer bases.
    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.config.timers = timers;
        self
    }

    /// Sets the host written into Via and Contact headers.
    pub fn with_local_host<T: AsRef<str>>(mut self, host: T) -> Self {
        self.config.local_host = Some(host.as_ref().to_string());
        self
    }

    /// Adds a UDP transport bound to `addr`.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.config.listen.push((addr, crate::message::TransportKind::Udp));
        self.transport_start.push(Box::new(UdpStartup::new(addr)));
        self
    }

    /// Sets the application callbacks.
    pub fn with_application(mut self, application: impl Application) -> Self {
        self.application = Some(Arc::new(application));
        self
    }

    /// Sets the authenticator port.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Attaches a registrar backed by the in-memory store.
    pub fn with_registrar(self) -> Self {
        self.with_registrar_store(Box::new(MemoryStore::new()))
    }

    /// Attaches a registrar with a custom backend.
    pub fn with_registrar_store(mut self, store: Box<dyn RegStore>) -> Self {
        self.registrar_store = Some(store);
        self
    }

    /// Appends a plugin to the hook chain. Order matters: hooks fold
    /// over plugins in registration order.
    pub fn with_plugin(mut self, plugin: impl Plugin) -> Self {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            log::warn!("Plugin with name '{}' already exists", plugin.name());
            return self;
        }
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Finalizes the builder into an `Endpoint`.
    pub async fn build(self) -> Endpoint {
        log::trace!("Creating endpoint...");
        if !self.plugins.is_empty() {
            log::debug!(
                "Plugins registered ({})",
                self.plugins.iter().map(|p| p.name()).join(", ")
            );
        }

        let plugins = PluginChain::new(self.plugins);

        let registrar = self.registrar_store.map(|store| {
            Registrar::spawn(
                store,
                self.authenticator.clone(),
                plugins.clone(),
                self.config.registrar.clone(),
            )
        });

        let application = self
            .application
            .unwrap_or_else(|| Arc::new(DefaultApplication));

        let endpoint = Endpoint(Arc::new(Inner {
            transport: self.transport,
            calls: Default::default(),
            registrar,
            application,
            plugins,
            config: self.config,
        }));

        let tx = endpoint.transport().sender();
        for tp_start in self.transport_start {
            if let Err(err) = tp_start.start(tx.clone()).await {
                log::warn!("Failed to start transport: {err}");
            }
        }

        endpoint
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
