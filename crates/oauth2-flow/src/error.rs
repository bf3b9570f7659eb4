//! Error types for the authorization flow

/// Errors surfaced to completions, HTTP callers and registration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid provider configuration: {0}")]
    Configuration(String),

    #[error("duplicate provider: {0}")]
    DuplicateProvider(String),

    #[error("unregistered provider: {0}")]
    UnregisteredProvider(String),

    #[error("login prompt delivery failed: {0}")]
    Delivery(String),

    #[error("invalid state in callback")]
    InvalidState,

    #[error("authorization denied by provider: {0}")]
    Denied(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("authentication request expired before the user completed it")]
    Expired,

    #[error("credential store error: {0}")]
    Store(String),
}

/// Result alias for flow operations.
pub type Result<T> = std::result::Result<T, Error>;
