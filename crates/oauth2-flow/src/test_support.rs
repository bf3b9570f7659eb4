//! Shared fakes for unit tests

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::Secret;
use tokio::net::TcpListener;

use crate::BoxFuture;
use crate::config::{Endpoint, ProviderConfig};
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::token::{AuthenticatedClient, Credential, Exchanger};

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_server(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn test_config(name: &str, token_url: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        url: "http://bot.example.com".into(),
        client_id: "client-id".into(),
        client_secret: Secret::new("client-secret".into()),
        scopes: vec!["openid".into(), "email".into()],
        endpoint: Endpoint {
            auth_url: "https://provider.example.com/authorize".into(),
            token_url: token_url.into(),
        },
    }
}

pub fn test_credential(suffix: &str) -> Credential {
    Credential {
        access_token: format!("at_{suffix}"),
        refresh_token: Some(format!("rt_{suffix}")),
        expires: Some(1_735_500_000_000),
        token_type: "Bearer".into(),
    }
}

/// Exchanger that never touches the network.
pub struct FakeExchanger {
    outcome: std::result::Result<Credential, String>,
    delay: Duration,
    pub exchanges: AtomicUsize,
}

impl FakeExchanger {
    pub fn succeeding(credential: Credential) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(credential),
            delay: Duration::ZERO,
            exchanges: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(message.to_string()),
            delay: Duration::ZERO,
            exchanges: AtomicUsize::new(0),
        })
    }

    /// Succeeds after sleeping, to widen race windows in concurrency tests.
    pub fn slow(credential: Credential, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(credential),
            delay,
            exchanges: AtomicUsize::new(0),
        })
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

impl Exchanger for FakeExchanger {
    fn authorization_url(&self, state: &str) -> String {
        format!("https://provider.example.com/authorize?state={state}")
    }

    fn exchange<'a>(&'a self, _code: &'a str) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone().map_err(Error::Exchange)
        })
    }

    fn client(&self, credential: Credential) -> AuthenticatedClient {
        AuthenticatedClient::new(reqwest::Client::new(), credential)
    }
}

/// Notifier that records every prompt, or fails every send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// The `state` value from the most recent login prompt.
    pub fn last_state(&self) -> String {
        let (_, text) = self.messages().pop().expect("no prompt sent");
        text.rsplit("state=").next().unwrap().to_string()
    }
}

impl Notifier for RecordingNotifier {
    fn send_direct<'a>(&'a self, user_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(Error::Delivery("chat backend unavailable".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((user_id.to_string(), text.to_string()));
            Ok(())
        })
    }
}
