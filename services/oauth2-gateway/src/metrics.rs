//! Prometheus metrics exposition
//!
//! Renders every metric recorded in the process, including the flow
//! metrics emitted by `oauth2-flow`:
//!
//! - `oauth2_authentications_total` (counter): labels `provider`, `outcome`
//! - `oauth2_callbacks_total` (counter): labels `provider`, `outcome`
//! - `oauth2_pending_completions` (gauge): label `provider`
//! - `oauth2_admin_requests_total` (counter): labels `route`, `status`

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record an admin API request with its route template and status code.
pub fn record_admin_request(route: &'static str, status: u16) {
    metrics::counter!(
        "oauth2_admin_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
}
