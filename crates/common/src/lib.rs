//! Shared types for the OAuth2 gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
