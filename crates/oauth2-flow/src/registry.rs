//! Provider multiplexing
//!
//! Feature code asks for "a Google client for this user" through
//! `FlowRegistry::authenticate`; the registry picks the flow registered
//! under that provider name. Each flow owns its own pending registry, so a
//! state minted for one provider is meaningless to another's callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::{debug, error, info};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::flow::{AuthorizationFlow, DEFAULT_PENDING_TTL};
use crate::notify::Notifier;
use crate::pending::Completion;
use crate::store::{CredentialStore, KeyValueStore};
use crate::token::{Exchanger, HttpExchanger};

/// Named authorization flows sharing one credential backend and notifier.
pub struct FlowRegistry {
    flows: HashMap<String, Arc<AuthorizationFlow>>,
    backend: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    http: reqwest::Client,
    pending_ttl: Duration,
}

impl FlowRegistry {
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            backend,
            notifier,
            http,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }

    /// TTL applied to flows registered after this call.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Validate `config` and register an HTTP-backed flow for it.
    ///
    /// Invalid and duplicate providers are logged and rejected; flows
    /// already registered are unaffected.
    pub fn register(&mut self, config: ProviderConfig) -> Result<()> {
        let exchanger = self
            .validated(&config)
            .and_then(|()| HttpExchanger::new(&config, self.http.clone()));
        match exchanger {
            Ok(exchanger) => self.insert(config, Arc::new(exchanger)),
            Err(e) => {
                error!(provider = %config.name, error = %e, "skipping oauth2 provider");
                Err(e)
            }
        }
    }

    /// Register a flow that uses a caller-supplied exchange collaborator.
    pub fn register_with_exchanger(
        &mut self,
        config: ProviderConfig,
        exchanger: Arc<dyn Exchanger>,
    ) -> Result<()> {
        if let Err(e) = self.validated(&config) {
            error!(provider = %config.name, error = %e, "skipping oauth2 provider");
            return Err(e);
        }
        self.insert(config, exchanger)
    }

    fn validated(&self, config: &ProviderConfig) -> Result<()> {
        config.validate()?;
        if self.flows.contains_key(&config.name) {
            return Err(Error::DuplicateProvider(config.name.clone()));
        }
        Ok(())
    }

    fn insert(&mut self, config: ProviderConfig, exchanger: Arc<dyn Exchanger>) -> Result<()> {
        let name = config.name.clone();
        let store = CredentialStore::new(name.clone(), self.backend.clone());
        let flow = AuthorizationFlow::new(config, exchanger, store, self.notifier.clone())
            .with_pending_ttl(self.pending_ttl);

        info!(
            provider = %name,
            auth_path = %flow.config().auth_path(),
            login_path = %flow.config().login_path(),
            "registered oauth2 provider"
        );
        self.flows.insert(name, Arc::new(flow));
        Ok(())
    }

    pub fn flow(&self, provider: &str) -> Option<&Arc<AuthorizationFlow>> {
        self.flows.get(provider)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.keys().cloned().collect();
        names.sort();
        names
    }

    /// Obtain an authenticated client for `user_id` from `provider`.
    ///
    /// An unknown provider resolves `on_complete` with
    /// `Error::UnregisteredProvider` before returning.
    pub async fn authenticate(&self, provider: &str, user_id: &str, on_complete: Completion) {
        match self.flows.get(provider) {
            Some(flow) => flow.authenticate(user_id, on_complete).await,
            None => {
                debug!(provider, user_id, "authenticate for unregistered provider");
                on_complete.resolve(Err(Error::UnregisteredProvider(provider.to_string())));
            }
        }
    }

    /// Delete the stored credential for `user_id` at `provider`.
    pub async fn logout(&self, provider: &str, user_id: &str) -> Result<()> {
        let flow = self
            .flows
            .get(provider)
            .ok_or_else(|| Error::UnregisteredProvider(provider.to_string()))?;
        flow.logout(user_id).await
    }

    /// Login and callback routes for every registered provider.
    pub fn router(&self) -> Router {
        self.flows
            .values()
            .fold(Router::new(), |router, flow| router.merge(flow.router()))
    }

    /// Spawn a background task that expires abandoned authentication
    /// requests every `interval`.
    ///
    /// Only flows registered before this call are swept.
    pub fn spawn_sweep_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let flows: Vec<Arc<AuthorizationFlow>> = self.flows.values().cloned().collect();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick, nothing is pending yet
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for flow in &flows {
                    flow.sweep_expired();
                }
            }
        })
    }
}
