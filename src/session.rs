//! Session context: the current proxy plus an optional anonymity process
//!
//! A session is built from a descriptor, a proxy URL or anonymity defaults,
//! then entered. While entered it hands out proxy connectors, swaps its
//! descriptor on rotation and asks the anonymity process for new circuits.
//! Exiting releases the control channel and any process the session spawned.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use tracing::{debug, info, instrument};

use crate::anonymity::{AnonymityController, AnonymityState};
use crate::error::{Result, RotanetError};
use crate::models::{AnonymityConfig, ProxyDescriptor, ProxyProtocol};
use crate::proxy::ProxyConnector;

/// Host the anonymity process serves SOCKS on
const ANONYMITY_HOST: &str = "localhost";

pub struct SessionContext {
    proxy: ArcSwapOption<ProxyDescriptor>,
    anonymity: Option<AnonymityConfig>,
    route_dns_via_proxy: bool,
    controller: AnonymityController,
    entered: bool,
}

impl SessionContext {
    pub fn new(anonymity: Option<AnonymityConfig>, proxy: Option<ProxyDescriptor>) -> Self {
        Self {
            proxy: ArcSwapOption::from(proxy.map(Arc::new)),
            anonymity,
            route_dns_via_proxy: false,
            controller: AnonymityController::new(),
            entered: false,
        }
    }

    /// Build a session from `scheme://[user[:pass]@]host:port`
    pub fn from_proxy_url(url: &str, anonymity: Option<AnonymityConfig>) -> Result<Self> {
        let proxy = ProxyDescriptor::parse_url(url, false)?;
        Ok(Self::new(anonymity, Some(proxy)))
    }

    /// A session that routes through a (possibly launched) anonymity process.
    ///
    /// The descriptor comes from the anonymity defaults.
    pub fn for_anonymity(mut config: AnonymityConfig) -> Self {
        config.enabled = true;
        let mut session = Self::new(Some(config), None);
        session.apply_anonymity_defaults();
        session
    }

    /// Resolve hostnames through the proxy for descriptors this session
    /// creates, including the current one.
    pub fn with_route_dns_via_proxy(mut self, enabled: bool) -> Self {
        self.route_dns_via_proxy = enabled;
        if enabled {
            if let Some(current) = self.proxy.load_full() {
                let updated = current.as_ref().clone().with_route_dns_via_proxy(true);
                self.proxy.store(Some(Arc::new(updated)));
            }
        }
        self
    }

    fn anonymity_enabled(&self) -> bool {
        self.anonymity.as_ref().is_some_and(|config| config.enabled)
    }

    /// Fill in whatever anonymity settings are still unset.
    ///
    /// Without a descriptor the session proxies through SOCKS5 on the local
    /// anonymity port. Values already set are left alone, so this can run
    /// any number of times.
    pub fn apply_anonymity_defaults(&mut self) {
        let Some(config) = self.anonymity.as_mut().filter(|config| config.enabled) else {
            return;
        };

        let current = self.proxy.load_full();
        config.apply_defaults(current.as_ref().map(|proxy| proxy.port()));

        if current.is_none() {
            let proxy = ProxyDescriptor::new(ProxyProtocol::Socks5, ANONYMITY_HOST, config.socks_port())
                .with_route_dns_via_proxy(self.route_dns_via_proxy);
            debug!("Using anonymity proxy {}", proxy);
            self.proxy.store(Some(Arc::new(proxy)));
        }
    }

    /// Start the scope: apply defaults and bring up the anonymity process.
    ///
    /// On error nothing acquired during the attempt is left behind.
    #[instrument(skip(self))]
    pub async fn enter(&mut self) -> Result<()> {
        if self.entered {
            debug!("Session already entered");
            return Ok(());
        }

        self.apply_anonymity_defaults();

        if let Some(config) = self.anonymity.as_ref().filter(|config| config.enabled) {
            self.controller.start(config).await?;
        }

        self.entered = true;
        info!(proxy = %self.build_proxy_connector(), "Session entered");
        Ok(())
    }

    /// Connector for the current descriptor, or direct when there is none
    pub fn build_proxy_connector(&self) -> ProxyConnector {
        ProxyConnector::from(self.proxy.load().as_deref())
    }

    /// Replace the current descriptor
    pub fn rotate_proxy(&self, proxy: ProxyDescriptor) {
        debug!("Rotating proxy to {}", proxy);
        self.proxy.store(Some(Arc::new(proxy)));
    }

    /// Parse `url` and make it the current descriptor.
    ///
    /// The current descriptor is kept if parsing fails.
    pub fn rotate_proxy_from_url(&self, url: &str) -> Result<()> {
        let proxy = ProxyDescriptor::parse_url(url, self.route_dns_via_proxy)?;
        self.rotate_proxy(proxy);
        Ok(())
    }

    /// Ask the anonymity process for a new circuit and wait until it is usable.
    ///
    /// Concurrent callers send their signals one at a time, then each waits
    /// out its own delay. Returns the time waited.
    #[instrument(skip(self))]
    pub async fn request_new_identity(&self) -> Result<Duration> {
        if !self.entered || !self.anonymity_enabled() {
            return Err(RotanetError::NotEntered);
        }

        let wait = self.controller.signal_new_identity().await?;
        debug!("New identity requested, waiting {:?}", wait);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(wait)
    }

    /// End the scope. Safe to call repeatedly and after a failed `enter`.
    pub async fn exit(&mut self) {
        self.controller.shutdown().await;
        if self.entered {
            self.entered = false;
            info!("Session exited");
        }
    }

    /// Run `f` inside an entered scope; the scope is exited however `f` ends.
    pub async fn scoped<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a SessionContext) -> BoxFuture<'a, Result<T>>,
    {
        self.enter().await?;
        let result = f(&*self).await;
        self.exit().await;
        result
    }

    pub fn current_proxy(&self) -> Option<Arc<ProxyDescriptor>> {
        self.proxy.load_full()
    }

    pub fn anonymity(&self) -> Option<&AnonymityConfig> {
        self.anonymity.as_ref()
    }

    pub fn anonymity_state(&self) -> AnonymityState {
        self.controller.state()
    }

    /// True if the anonymity process was spawned by this session
    pub fn owns_anonymity_process(&self) -> bool {
        self.controller.owns_process()
    }

    pub fn is_entered(&self) -> bool {
        self.entered
    }

    pub fn route_dns_via_proxy(&self) -> bool {
        self.route_dns_via_proxy
    }
}
