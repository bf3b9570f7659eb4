//! Parked completions keyed by correlation token
//!
//! A `Completion` is parked here while the user is off at the provider.
//! `take` looks up and removes under one lock acquisition, so when the same
//! callback is delivered twice only one delivery ever gets the completion.
//! The lock is never held across I/O: callers take the record out first and
//! do the token exchange afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::token::AuthenticatedClient;

type Callback = Box<dyn FnOnce(Result<AuthenticatedClient>) + Send + 'static>;

/// The caller's single-shot continuation.
///
/// `resolve` consumes the completion, so it cannot fire twice.
pub struct Completion(Callback);

impl Completion {
    pub fn new(f: impl FnOnce(Result<AuthenticatedClient>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Completion that forwards its result into a oneshot channel.
    ///
    /// A dropped receiver is ignored: the caller has stopped waiting.
    pub fn channel() -> (Self, oneshot::Receiver<Result<AuthenticatedClient>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn resolve(self, result: Result<AuthenticatedClient>) {
        (self.0)(result)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// A user's authentication attempt waiting for the provider callback.
#[derive(Debug)]
pub struct PendingCompletion {
    pub user_id: String,
    pub completion: Completion,
    pub created_at: Instant,
}

impl PendingCompletion {
    pub fn new(user_id: impl Into<String>, completion: Completion) -> Self {
        Self {
            user_id: user_id.into(),
            completion,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() >= max_age
    }

    pub fn resolve(self, result: Result<AuthenticatedClient>) {
        self.completion.resolve(result)
    }
}

/// Concurrency-safe map from correlation token to pending completion.
#[derive(Debug, Default)]
pub struct PendingAuthRegistry {
    entries: Mutex<HashMap<String, PendingCompletion>>,
}

impl PendingAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `record` under `token`, replacing any existing record.
    ///
    /// Tokens carry 256 bits of entropy, so a replacement only happens if a
    /// caller reuses a token on purpose. The replaced record is returned so
    /// it can still be resolved.
    pub fn put(&self, token: String, record: PendingCompletion) -> Option<PendingCompletion> {
        self.lock().insert(token, record)
    }

    /// Atomically look up and remove the record for `token`.
    pub fn take(&self, token: &str) -> Option<PendingCompletion> {
        self.lock().remove(token)
    }

    /// Remove without resolving.
    pub fn delete(&self, token: &str) {
        self.lock().remove(token);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record at least `max_age` old and hand them back for
    /// resolution outside the lock.
    pub fn sweep(&self, max_age: Duration) -> Vec<PendingCompletion> {
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, record)| record.is_expired(max_age))
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .iter()
            .filter_map(|token| entries.remove(token))
            .collect()
    }

    // No operation can panic while holding the lock, but a panicking
    // completion elsewhere must not wedge the registry.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCompletion>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
