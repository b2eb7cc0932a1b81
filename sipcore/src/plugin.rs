//! The plugin hook chain.
//!
//! Plugins extend the core at fixed, typed hook points. Each hook
//! folds over the ordered chain: a hook either passes (possibly
//! rewritten) arguments on with [`HookOutcome::Continue`] or stops the
//! operation with [`HookOutcome::ShortCircuit`]. Handlers are resolved
//! when the endpoint is built, never by name at runtime.

use std::sync::Arc;

use crate::headers::Headers;
use crate::registrar::RegisterOpts;
use crate::router::{ProxyOpts, SipReply};
use crate::transport::{IncomingRequest, Packet};

/// What a hook decided.
pub enum HookOutcome<T> {
    /// Keep going with these (possibly rewritten) arguments.
    Continue(T),
    /// Stop; answer the triggering request with this reply.
    ShortCircuit(SipReply),
}

/// The hooks a plugin can implement. Every default passes through.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait Plugin: Sync + Send + 'static {
    /// The plugin name, used only for startup logging.
    fn name(&self) -> &str;

    /// Adjusts proxy options before a request is forwarded.
    async fn uac_proxy_opts(
        &self,
        request: &IncomingRequest,
        opts: ProxyOpts,
    ) -> HookOutcome<ProxyOpts> {
        HookOutcome::Continue(opts)
    }

    /// Adjusts the extra headers added to outbound UAC requests.
    async fn transport_uac_headers(&self, headers: Headers) -> HookOutcome<Headers> {
        HookOutcome::Continue(headers)
    }

    /// Adjusts registrar options for one REGISTER request.
    async fn registrar_request_opts(
        &self,
        request: &IncomingRequest,
        opts: RegisterOpts,
    ) -> HookOutcome<RegisterOpts> {
        HookOutcome::Continue(opts)
    }

    /// Rewrites the registrar's reply before it is sent.
    async fn registrar_request_reply(&self, reply: SipReply) -> HookOutcome<SipReply> {
        HookOutcome::Continue(reply)
    }

    /// Overrides the instance index a contact registers under.
    async fn registrar_get_index(
        &self,
        instance: Option<&str>,
        index: Arc<str>,
    ) -> HookOutcome<Arc<str>> {
        HookOutcome::Continue(index)
    }

    /// Observes bytes sent on a connection.
    async fn connection_sent(&self, packet: &Packet) -> HookOutcome<()> {
        HookOutcome::Continue(())
    }

    /// Observes bytes received on a connection.
    async fn connection_recv(&self, packet: &Packet) -> HookOutcome<()> {
        HookOutcome::Continue(())
    }
}

macro_rules! fold_hook {
    ($self:ident, $args:ident, |$plugin:ident| $call:expr) => {{
        let mut $args = $args;
        for $plugin in $self.0.iter() {
            match $call {
                HookOutcome::Continue(next) => $args = next,
                HookOutcome::ShortCircuit(reply) => {
                    return HookOutcome::ShortCircuit(reply);
                }
            }
        }
        HookOutcome::Continue($args)
    }};
}

/// The ordered plugin chain, resolved at startup.
#[derive(Clone, Default)]
pub struct PluginChain(Arc<[Box<dyn Plugin>]>);

impl PluginChain {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        PluginChain(plugins.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|p| p.name())
    }

    pub async fn uac_proxy_opts(
        &self,
        request: &IncomingRequest,
        opts: ProxyOpts,
    ) -> HookOutcome<ProxyOpts> {
        fold_hook!(self, opts, |plugin| plugin.uac_proxy_opts(request, opts).await)
    }

    pub async fn transport_uac_headers(&self, headers: Headers) -> HookOutcome<Headers> {
        fold_hook!(self, headers, |plugin| plugin.transport_uac_headers(headers).await)
    }

    pub async fn registrar_request_opts(
        &self,
        request: &IncomingRequest,
        opts: RegisterOpts,
    ) -> HookOutcome<RegisterOpts> {
        fold_hook!(self, opts, |plugin| plugin
            .registrar_request_opts(request, opts)
            .await)
    }

    pub async fn registrar_request_reply(&self, reply: SipReply) -> HookOutcome<SipReply> {
        fold_hook!(self, reply, |plugin| plugin.registrar_request_reply(reply).await)
    }

    pub async fn registrar_get_index(
        &self,
        instance: Option<&str>,
        index: Arc<str>,
    ) -> HookOutcome<Arc<str>> {
        fold_hook!(self, index, |plugin| plugin
            .registrar_get_index(instance, index)
            .await)
    }

    pub async fn connection_sent(&self, packet: &Packet) -> HookOutcome<()> {
        for plugin in self.0.iter() {
            if let HookOutcome::ShortCircuit(reply) = plugin.connection_sent(packet).await {
                return HookOutcome::ShortCircuit(reply);
            }
        }
        HookOutcome::Continue(())
    }

    pub async fn connection_recv(&self, packet: &Packet) -> HookOutcome<()> {
        for plugin in self.0.iter() {
            if let HookOutcome::ShortCircuit(reply) = plugin.connection_recv(packet).await {
                return HookOutcome::ShortCircuit(reply);
            }
        }
        HookOutcome::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};
    use crate::transaction::mock;

    struct RecordRoutePlugin;

    #[async_trait::async_trait]
    impl Plugin for RecordRoutePlugin {
        fn name(&self) -> &str {
            "record-route"
        }

        async fn uac_proxy_opts(
            &self,
            _request: &IncomingRequest,
            mut opts: ProxyOpts,
        ) -> HookOutcome<ProxyOpts> {
            opts.record_route = true;
            HookOutcome::Continue(opts)
        }
    }

    struct RejectPlugin;

    #[async_trait::async_trait]
    impl Plugin for RejectPlugin {
        fn name(&self) -> &str {
            "reject"
        }

        async fn uac_proxy_opts(
            &self,
            _request: &IncomingRequest,
            _opts: ProxyOpts,
        ) -> HookOutcome<ProxyOpts> {
            HookOutcome::ShortCircuit(SipReply::new(StatusCode::Forbidden))
        }
    }

    #[tokio::test]
    async fn test_chain_folds_in_order() {
        let chain = PluginChain::new(vec![Box::new(RecordRoutePlugin)]);
        let request = mock::request(SipMethod::Invite);

        let outcome = chain.uac_proxy_opts(&request, ProxyOpts::default()).await;
        let HookOutcome::Continue(opts) = outcome else {
            panic!("expected continue");
        };
        assert!(opts.record_route);
    }

    #[tokio::test]
    async fn test_short_circuit_wins() {
        let chain = PluginChain::new(vec![Box::new(RejectPlugin), Box::new(RecordRoutePlugin)]);
        let request = mock::request(SipMethod::Invite);

        let outcome = chain.uac_proxy_opts(&request, ProxyOpts::default()).await;
        let HookOutcome::ShortCircuit(reply) = outcome else {
            panic!("expected short circuit");
        };
        assert_eq!(reply.code, StatusCode::Forbidden);
    }
}
