//! Correlation token generation
//!
//! The OAuth2 `state` parameter is the only thing binding a provider
//! redirect to the completion parked for it, so it has to be unguessable:
//! 32 bytes from the OS-seeded CSPRNG, base64url without padding.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

/// Number of random bytes in a correlation token (256 bits).
pub const STATE_BYTES: usize = 32;

/// Mint a fresh correlation token.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
