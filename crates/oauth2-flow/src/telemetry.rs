//! Metrics emitted by the flows
//!
//! - `oauth2_authentications_total` (counter): labels `provider`, `outcome`
//! - `oauth2_callbacks_total` (counter): labels `provider`, `outcome`
//! - `oauth2_pending_completions` (gauge): label `provider`
//!
//! Without an installed recorder these calls are no-ops.

pub(crate) fn record_authentication(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "oauth2_authentications_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(crate) fn record_callback(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "oauth2_callbacks_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(crate) fn set_pending(provider: &str, pending: usize) {
    metrics::gauge!("oauth2_pending_completions", "provider" => provider.to_string())
        .set(pending as f64);
}
