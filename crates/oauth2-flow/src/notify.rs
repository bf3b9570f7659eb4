//! Delivery of login prompts to users
//!
//! The flow never talks to a chat backend directly. It hands the prompt to
//! a `Notifier`, and a failed send is reported back to the caller before
//! any pending state survives.

use serde::Serialize;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::error::{Error, Result};

/// Sends a direct message to a user.
pub trait Notifier: Send + Sync {
    fn send_direct<'a>(&'a self, user_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Writes prompts to the log instead of a chat backend. Useful locally.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_direct<'a>(&'a self, user_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(user_id, prompt = text, "login prompt");
            Ok(())
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: &'a str,
    text: &'a str,
}

/// Posts prompts as JSON to a chat bridge webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    async fn post(&self, user_id: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(&WebhookPayload { user_id, text })
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Delivery(format!("webhook returned {status}")));
        }
        debug!(user_id, "login prompt delivered via webhook");
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn send_direct<'a>(&'a self, user_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post(user_id, text))
    }
}
