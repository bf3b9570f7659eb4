//! OAuth2 authorization-code correlation engine
//!
//! Lets request-driven features obtain an authenticated HTTP client for a
//! user. A cached credential is handed back immediately; otherwise the user
//! is sent a login link carrying an unguessable `state` token and the
//! caller's completion is parked until the provider redirects back with
//! that token.
//!
//! Flow for a cache miss:
//! 1. `FlowRegistry::authenticate()` dispatches to the provider's flow
//! 2. `state::generate_state()` mints the correlation token
//! 3. The completion is parked in `pending::PendingAuthRegistry`
//! 4. `notify::Notifier` delivers the login link to the user
//! 5. `GET /oauth2/<name>/login` redirects to the provider
//! 6. `GET /oauth2/<name>/auth` takes the parked completion, exchanges the
//!    code via `token::Exchanger`, stores the credential and resolves it

pub mod config;
pub mod error;
pub mod flow;
pub mod notify;
pub mod pending;
pub mod registry;
pub mod state;
pub mod store;
mod telemetry;
pub mod token;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::pin::Pin;

pub use config::{Endpoint, ProviderConfig};
pub use error::{Error, Result};
pub use flow::{AuthorizationFlow, CallbackParams, DEFAULT_PENDING_TTL};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use pending::{Completion, PendingAuthRegistry, PendingCompletion};
pub use registry::FlowRegistry;
pub use state::generate_state;
pub use store::{CredentialStore, FileStore, KeyValueStore, MemoryStore};
pub use token::{AuthenticatedClient, Credential, Exchanger, HttpExchanger, TokenResponse};

/// Boxed future returned by the collaborator traits so they stay
/// usable as `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
