//! Authorization-code flow for one provider
//!
//! Per authentication attempt the flow moves through
//! `NotStarted → AwaitingCallback → Resolved(success | error)`:
//!
//! - `authenticate` answers from the credential cache, or mints a state
//!   token, parks the caller's completion and sends the user a login link
//! - `GET <login_path>` redirects the browser to the provider, carrying the
//!   state through unchanged
//! - `GET <auth_path>` takes the parked completion, exchanges the code,
//!   caches the credential and resolves the completion
//!
//! Every completion is resolved exactly once: by the cache hit, by a failed
//! prompt delivery, by the callback that wins `PendingAuthRegistry::take`,
//! or by the expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::pending::{Completion, PendingAuthRegistry, PendingCompletion};
use crate::state::generate_state;
use crate::store::CredentialStore;
use crate::telemetry;
use crate::token::Exchanger;

/// How long a parked completion waits for its callback.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600); // 10 minutes

/// Query parameters on the login and callback routes.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    /// Set by the provider when the user declines consent
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Orchestrates the authorization-code grant for a single provider.
pub struct AuthorizationFlow {
    config: ProviderConfig,
    exchanger: Arc<dyn Exchanger>,
    store: CredentialStore,
    pending: PendingAuthRegistry,
    notifier: Arc<dyn Notifier>,
    pending_ttl: Duration,
}

impl AuthorizationFlow {
    pub fn new(
        config: ProviderConfig,
        exchanger: Arc<dyn Exchanger>,
        store: CredentialStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            exchanger,
            store,
            pending: PendingAuthRegistry::new(),
            notifier,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn pending(&self) -> &PendingAuthRegistry {
        &self.pending
    }

    /// Obtain an authenticated client for `user_id`.
    ///
    /// On a cache hit `on_complete` runs before this returns and no state is
    /// minted. Otherwise the user is prompted and `on_complete` runs when the
    /// provider calls back (or the attempt expires). If the prompt cannot be
    /// delivered, `on_complete` receives the delivery error before this
    /// returns and nothing stays parked.
    pub async fn authenticate(&self, user_id: &str, on_complete: Completion) {
        if let Some(credential) = self.store.get(user_id).await {
            debug!(provider = %self.config.name, user_id, "credential cache hit");
            telemetry::record_authentication(&self.config.name, "cached");
            on_complete.resolve(Ok(self.exchanger.client(credential)));
            return;
        }

        let state = generate_state();
        let prompt = format!(
            "I need you to log in before you can do that: {}?state={}",
            self.config.login_url(),
            state
        );

        // Parked before the prompt goes out: the user may follow the link
        // before send_direct returns.
        let record = PendingCompletion::new(user_id, on_complete);
        if let Some(previous) = self.pending.put(state.clone(), record) {
            previous.resolve(Err(Error::InvalidState));
        }

        if let Err(e) = self.notifier.send_direct(user_id, &prompt).await {
            warn!(provider = %self.config.name, user_id, error = %e, "login prompt delivery failed");
            telemetry::record_authentication(&self.config.name, "delivery_failed");
            match self.pending.take(&state) {
                Some(record) => record.resolve(Err(e)),
                None => warn!(
                    provider = %self.config.name,
                    user_id,
                    "pending completion resolved before delivery failure was reported"
                ),
            }
            self.update_pending_gauge();
            return;
        }

        info!(provider = %self.config.name, user_id, "login prompt sent, awaiting callback");
        telemetry::record_authentication(&self.config.name, "prompted");
        self.update_pending_gauge();
    }

    /// Redirect the browser to the provider's authorize endpoint.
    pub fn handle_login_redirect(&self, params: &CallbackParams) -> Response {
        let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) else {
            debug!(provider = %self.config.name, "login request without state");
            return (StatusCode::BAD_REQUEST, "missing state").into_response();
        };

        (
            StatusCode::FOUND,
            [(header::LOCATION, self.exchanger.authorization_url(state))],
        )
            .into_response()
    }

    /// Resolve the parked completion for the callback's state.
    pub async fn handle_provider_callback(&self, params: &CallbackParams) -> Response {
        let state = params.state.as_deref().unwrap_or_default();
        let taken = if state.is_empty() {
            None
        } else {
            self.pending.take(state)
        };

        let Some(record) = taken else {
            warn!(provider = %self.config.name, "callback with unknown or already used state");
            telemetry::record_callback(&self.config.name, "invalid_state");
            return (StatusCode::UNAUTHORIZED, "invalid state").into_response();
        };
        self.update_pending_gauge();

        if record.is_expired(self.pending_ttl) {
            warn!(provider = %self.config.name, user_id = %record.user_id, "callback for expired state");
            telemetry::record_callback(&self.config.name, "expired");
            record.resolve(Err(Error::InvalidState));
            return (StatusCode::UNAUTHORIZED, "invalid state").into_response();
        }

        if let Some(error) = params.error.as_deref() {
            let reason = match params.error_description.as_deref() {
                Some(description) => format!("{error}: {description}"),
                None => error.to_string(),
            };
            info!(provider = %self.config.name, user_id = %record.user_id, reason = %reason, "provider denied authorization");
            telemetry::record_callback(&self.config.name, "denied");
            let body = format!("authorization denied: {reason}");
            record.resolve(Err(Error::Denied(reason)));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }

        let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
            warn!(provider = %self.config.name, user_id = %record.user_id, "callback without code");
            telemetry::record_callback(&self.config.name, "missing_code");
            record.resolve(Err(Error::Exchange("callback missing code".into())));
            return (StatusCode::BAD_REQUEST, "missing code").into_response();
        };

        let credential = match self.exchanger.exchange(code).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(provider = %self.config.name, user_id = %record.user_id, error = %e, "code exchange failed");
                telemetry::record_callback(&self.config.name, "exchange_failed");
                let body = e.to_string();
                record.resolve(Err(e));
                return (StatusCode::BAD_REQUEST, body).into_response();
            }
        };

        if let Err(e) = self.store.set(&record.user_id, &credential).await {
            warn!(
                provider = %self.config.name,
                user_id = %record.user_id,
                error = %e,
                "credential not cached, user will be prompted again next time"
            );
        }

        info!(provider = %self.config.name, user_id = %record.user_id, "authentication completed");
        telemetry::record_callback(&self.config.name, "success");
        record.resolve(Ok(self.exchanger.client(credential)));

        (
            StatusCode::OK,
            "Authentication complete. You can close this window.",
        )
            .into_response()
    }

    /// Resolve every parked completion older than the pending TTL with
    /// `Error::Expired`. Returns how many were resolved.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.pending.sweep(self.pending_ttl);
        let count = expired.len();
        if count == 0 {
            return 0;
        }

        for record in expired {
            debug!(provider = %self.config.name, user_id = %record.user_id, "authentication request expired");
            record.resolve(Err(Error::Expired));
        }
        info!(provider = %self.config.name, expired = count, "swept abandoned authentication requests");
        self.update_pending_gauge();
        count
    }

    /// Forget the stored credential so the next `authenticate` prompts again.
    pub async fn logout(&self, user_id: &str) -> Result<()> {
        self.store.delete(user_id).await?;
        info!(provider = %self.config.name, user_id, "credential removed");
        Ok(())
    }

    /// Routes for the login redirect and the provider callback.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.auth_path(), get(provider_callback))
            .route(&self.config.login_path(), get(login_redirect))
            .with_state(self.clone())
    }

    fn update_pending_gauge(&self) {
        telemetry::set_pending(&self.config.name, self.pending.len());
    }
}

async fn login_redirect(
    State(flow): State<Arc<AuthorizationFlow>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    flow.handle_login_redirect(&params)
}

async fn provider_callback(
    State(flow): State<Arc<AuthorizationFlow>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    flow.handle_provider_callback(&params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::test_support::{FakeExchanger, RecordingNotifier, test_config, test_credential};
    use crate::token::{AuthenticatedClient, HttpExchanger};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot::error::TryRecvError;
    use tower::ServiceExt;

    struct Harness {
        flow: Arc<AuthorizationFlow>,
        exchanger: Arc<FakeExchanger>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(exchanger: Arc<FakeExchanger>, notifier: Arc<RecordingNotifier>) -> Harness {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let flow = AuthorizationFlow::new(
            test_config("google", "http://unused/token"),
            exchanger.clone() as Arc<dyn Exchanger>,
            CredentialStore::new("google", backend),
            notifier.clone() as Arc<dyn Notifier>,
        );
        Harness {
            flow: Arc::new(flow),
            exchanger,
            notifier,
        }
    }

    fn default_harness() -> Harness {
        harness(
            FakeExchanger::succeeding(test_credential("new")),
            Arc::new(RecordingNotifier::default()),
        )
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn resolved(
        rx: &mut tokio::sync::oneshot::Receiver<Result<AuthenticatedClient>>,
    ) -> Result<AuthenticatedClient> {
        rx.try_recv().expect("completion should have fired")
    }

    #[tokio::test]
    async fn cache_hit_resolves_immediately_without_prompt() {
        let h = default_harness();
        h.flow.store().set("jean", &test_credential("cached")).await.unwrap();

        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;

        let client = resolved(&mut rx).expect("cache hit yields a client");
        assert_eq!(client.credential().access_token, "at_cached");
        assert!(h.flow.pending().is_empty(), "cache hit must not park anything");
        assert!(h.notifier.messages().is_empty(), "cache hit must not prompt");
    }

    #[tokio::test]
    async fn cache_miss_prompts_and_waits_for_callback() {
        let h = default_harness();

        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.flow.pending().len(), 1);

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "jean");
        assert!(
            messages[0]
                .1
                .starts_with("I need you to log in before you can do that: http://bot.example.com/oauth2/google/login?state="),
            "got: {}",
            messages[0].1
        );
        assert_eq!(h.notifier.last_state().len(), 43);
    }

    #[tokio::test]
    async fn delivery_failure_resolves_with_error_and_parks_nothing() {
        let h = harness(
            FakeExchanger::succeeding(test_credential("new")),
            RecordingNotifier::failing(),
        );

        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;

        assert!(matches!(resolved(&mut rx), Err(Error::Delivery(_))));
        assert!(h.flow.pending().is_empty());
    }

    /// Records the prompt, then fails only once the test releases it.
    #[derive(Default)]
    struct StallingNotifier {
        prompt: std::sync::Mutex<String>,
        sent: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl Notifier for StallingNotifier {
        fn send_direct<'a>(
            &'a self,
            _user_id: &'a str,
            text: &'a str,
        ) -> crate::BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                *self.prompt.lock().unwrap() = text.to_string();
                self.sent.notify_one();
                self.release.notified().await;
                Err(Error::Delivery("timed out after the user clicked".into()))
            })
        }
    }

    #[tokio::test]
    async fn callback_before_late_delivery_failure_keeps_its_result() {
        let notifier = Arc::new(StallingNotifier::default());
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let flow = Arc::new(AuthorizationFlow::new(
            test_config("google", "http://unused/token"),
            FakeExchanger::succeeding(test_credential("new")),
            CredentialStore::new("google", backend),
            notifier.clone(),
        ));

        let (completion, mut rx) = Completion::channel();
        let authenticating = tokio::spawn({
            let flow = flow.clone();
            async move { flow.authenticate("jean", completion).await }
        });

        notifier.sent.notified().await;
        let prompt = notifier.prompt.lock().unwrap().clone();
        let state = prompt.rsplit("state=").next().unwrap().to_string();
        let response = get(
            flow.router(),
            &format!("/oauth2/google/auth?state={state}&code=c"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        notifier.release.notify_one();
        authenticating.await.unwrap();

        let client = resolved(&mut rx).expect("callback result must not be overwritten");
        assert_eq!(client.credential().access_token, "at_new");
        assert!(flow.pending().is_empty());
    }

    #[tokio::test]
    async fn login_without_state_is_bad_request() {
        let h = default_harness();
        let response = get(h.flow.router(), "/oauth2/google/login").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::LOCATION).is_none());

        let response = get(h.flow.router(), "/oauth2/google/login?state=").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_redirects_to_provider_with_state() {
        let config = test_config("google", "http://unused/token");
        let exchanger = HttpExchanger::new(&config, reqwest::Client::new()).unwrap();
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let flow = Arc::new(AuthorizationFlow::new(
            config,
            Arc::new(exchanger),
            CredentialStore::new("google", backend),
            Arc::new(RecordingNotifier::default()),
        ));

        let response = get(flow.router(), "/oauth2/google/login?state=foo").await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://provider.example.com/authorize?"));
        assert!(location.contains("state=foo"), "got: {location}");
        assert!(
            location.contains("redirect_uri=http%3A%2F%2Fbot.example.com%2Foauth2%2Fgoogle%2Fauth"),
            "got: {location}"
        );
    }

    #[tokio::test]
    async fn unknown_state_is_unauthorized_and_never_exchanges() {
        let h = default_harness();

        let response = get(h.flow.router(), "/oauth2/google/auth?state=forged&code=secret").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get(h.flow.router(), "/oauth2/google/auth?code=secret").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(h.exchanger.exchange_count(), 0);
    }

    #[tokio::test]
    async fn failed_exchange_resolves_error_and_stores_nothing() {
        let h = harness(
            FakeExchanger::failing("invalid_grant"),
            Arc::new(RecordingNotifier::default()),
        );
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        let state = h.notifier.last_state();

        let response = get(
            h.flow.router(),
            &format!("/oauth2/google/auth?state={state}&code=secret"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("invalid_grant"));
        assert!(matches!(resolved(&mut rx), Err(Error::Exchange(_))));
        assert!(h.flow.store().get("jean").await.is_none());
        assert!(h.flow.pending().is_empty(), "state is consumed even on failure");
    }

    #[tokio::test]
    async fn successful_callback_stores_credential_and_resolves_client() {
        let h = default_harness();
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        let state = h.notifier.last_state();

        let response = get(
            h.flow.router(),
            &format!("/oauth2/google/auth?state={state}&code=secret"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let client = resolved(&mut rx).expect("callback resolves with a client");
        assert_eq!(client.credential().access_token, "at_new");
        assert_eq!(h.flow.store().get("jean").await, Some(test_credential("new")));

        // The next request for the same user takes the cache-hit path
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        assert!(resolved(&mut rx).is_ok());
        assert_eq!(h.notifier.messages().len(), 1, "no second prompt");
    }

    #[tokio::test]
    async fn replayed_callback_is_unauthorized() {
        let h = default_harness();
        let (completion, _rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        let uri = format!("/oauth2/google/auth?state={}&code=secret", h.notifier.last_state());

        assert_eq!(get(h.flow.router(), &uri).await.status(), StatusCode::OK);
        assert_eq!(
            get(h.flow.router(), &uri).await.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(h.exchanger.exchange_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_callbacks_resolve_once() {
        let h = harness(
            FakeExchanger::slow(test_credential("new"), Duration::from_millis(50)),
            Arc::new(RecordingNotifier::default()),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        h.flow
            .authenticate(
                "jean",
                Completion::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        let uri = format!("/oauth2/google/auth?state={}&code=secret", h.notifier.last_state());

        let (a, b) = tokio::join!(get(h.flow.router(), &uri), get(h.flow.router(), &uri));

        let mut statuses = vec![a.status(), b.status()];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::UNAUTHORIZED]);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "completion must fire once");
        assert_eq!(h.exchanger.exchange_count(), 1);
    }

    #[tokio::test]
    async fn provider_denial_resolves_with_denied() {
        let h = default_harness();
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        let state = h.notifier.last_state();

        let response = get(
            h.flow.router(),
            &format!("/oauth2/google/auth?state={state}&error=access_denied"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(resolved(&mut rx), Err(Error::Denied(reason)) if reason == "access_denied"));
        assert_eq!(h.exchanger.exchange_count(), 0);
    }

    #[tokio::test]
    async fn callback_without_code_resolves_with_error() {
        let h = default_harness();
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        let state = h.notifier.last_state();

        let response = get(h.flow.router(), &format!("/oauth2/google/auth?state={state}")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(resolved(&mut rx), Err(Error::Exchange(_))));
        assert_eq!(h.exchanger.exchange_count(), 0);
    }

    #[tokio::test]
    async fn stale_state_at_callback_resolves_invalid_state() {
        let h = default_harness();
        let flow = Arc::new(
            AuthorizationFlow::new(
                h.flow.config().clone(),
                h.exchanger.clone(),
                h.flow.store().clone(),
                h.notifier.clone(),
            )
            .with_pending_ttl(Duration::ZERO),
        );
        let (completion, mut rx) = Completion::channel();
        flow.authenticate("jean", completion).await;
        let state = h.notifier.last_state();

        let response = get(flow.router(), &format!("/oauth2/google/auth?state={state}&code=c")).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(matches!(resolved(&mut rx), Err(Error::InvalidState)));
        assert_eq!(h.exchanger.exchange_count(), 0);
    }

    #[tokio::test]
    async fn sweep_resolves_abandoned_requests_with_expired() {
        let h = default_harness();
        let flow = AuthorizationFlow::new(
            h.flow.config().clone(),
            h.exchanger.clone(),
            h.flow.store().clone(),
            h.notifier.clone(),
        )
        .with_pending_ttl(Duration::ZERO);

        let (completion, mut rx) = Completion::channel();
        flow.authenticate("jean", completion).await;

        assert_eq!(flow.sweep_expired(), 1);
        assert!(matches!(resolved(&mut rx), Err(Error::Expired)));
        assert!(flow.pending().is_empty());
        assert_eq!(flow.sweep_expired(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_requests() {
        let h = default_harness();
        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;

        assert_eq!(h.flow.sweep_expired(), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.flow.pending().len(), 1);
    }

    #[tokio::test]
    async fn logout_forces_a_new_prompt() {
        let h = default_harness();
        h.flow.store().set("jean", &test_credential("cached")).await.unwrap();

        h.flow.logout("jean").await.unwrap();

        let (completion, mut rx) = Completion::channel();
        h.flow.authenticate("jean", completion).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.notifier.messages().len(), 1);
    }
}
