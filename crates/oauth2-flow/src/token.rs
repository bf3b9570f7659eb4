//! Authorization-code exchange against a provider
//!
//! `Exchanger` is the seam between the flow and the OAuth2 wire protocol:
//! building the authorize URL, trading a code for a credential, and wrapping
//! a credential in an authenticated client. `HttpExchanger` speaks standard
//! RFC 6749 to the provider's endpoints with `reqwest`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::BoxFuture;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Token material stored per user and provider.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta),
/// computed at exchange time from the token endpoint's `expires_in`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Response from the token endpoint.
///
/// Most providers answer with JSON; some (GitHub among them) answer with
/// `application/x-www-form-urlencoded` unless asked otherwise, so both are
/// accepted.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Decode a token endpoint body according to its content type.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self> {
        let response = if content_type.starts_with("application/x-www-form-urlencoded")
            || content_type.starts_with("text/plain")
        {
            Self::from_form(body)
        } else {
            serde_json::from_slice::<Self>(body)
                .map_err(|e| Error::Exchange(format!("invalid token response: {e}")))?
        };

        if response.access_token.is_empty() {
            return Err(Error::Exchange(
                "token response missing access_token".into(),
            ));
        }
        Ok(response)
    }

    fn from_form(body: &[u8]) -> Self {
        let mut response = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "access_token" => response.access_token = value.into_owned(),
                "token_type" => response.token_type = Some(value.into_owned()),
                "refresh_token" => response.refresh_token = Some(value.into_owned()),
                "expires_in" => response.expires_in = value.parse().ok(),
                _ => {}
            }
        }
        response
    }

    /// Convert into a stored credential, anchoring expiry at `now_millis`.
    pub fn into_credential(self, now_millis: u64) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires: self
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000))),
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_token_type),
        }
    }
}

/// HTTP client bound to a user's credential.
///
/// Every request built through it carries the access token as a bearer
/// `Authorization` header.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: reqwest::Client,
    credential: Credential,
}

impl AuthenticatedClient {
    pub fn new(http: reqwest::Client, credential: Credential) -> Self {
        Self { http, credential }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn request<U: reqwest::IntoUrl>(
        &self,
        method: reqwest::Method,
        url: U,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.credential.access_token)
    }

    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post<U: reqwest::IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, url)
    }
}

impl fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("token_type", &self.credential.token_type)
            .field("expires", &self.credential.expires)
            .finish_non_exhaustive()
    }
}

/// Standard authorization-code grant operations against one provider.
///
/// Uses `BoxFuture` return types for dyn-compatibility (`Arc<dyn Exchanger>`).
pub trait Exchanger: Send + Sync {
    /// Provider authorize URL that will echo `state` back on the callback.
    fn authorization_url(&self, state: &str) -> String;

    /// Trade an authorization code for a credential.
    fn exchange<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Credential>>;

    /// Wrap a credential in a client that authenticates its requests.
    fn client(&self, credential: Credential) -> AuthenticatedClient;
}

/// `Exchanger` that talks to the provider over HTTP.
pub struct HttpExchanger {
    http: reqwest::Client,
    authorize: Url,
    token_url: Url,
    client_id: String,
    client_secret: Secret<String>,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl HttpExchanger {
    pub fn new(config: &ProviderConfig, http: reqwest::Client) -> Result<Self> {
        let authorize = Url::parse(&config.endpoint.auth_url).map_err(|e| {
            Error::Configuration(format!("endpoint.auth_url is not a valid URL: {e}"))
        })?;
        let token_url = Url::parse(&config.endpoint.token_url).map_err(|e| {
            Error::Configuration(format!("endpoint.token_url is not a valid URL: {e}"))
        })?;

        Ok(Self {
            http,
            authorize,
            token_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.auth_url(),
            scopes: config.scopes.clone(),
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if !self.client_secret.is_empty() {
            form.push(("client_secret", self.client_secret.expose().as_str()));
        }

        let response = self
            .http
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Exchange(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Exchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Exchange(format!("reading token response: {e}")))?;

        Ok(TokenResponse::parse(&content_type, &body)?.into_credential(now_millis()))
    }
}

impl Exchanger for HttpExchanger {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorize.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code");
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            query.append_pair("state", state);
        }
        url.into()
    }

    fn exchange<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(self.exchange_code(code))
    }

    fn client(&self, credential: Credential) -> AuthenticatedClient {
        AuthenticatedClient::new(self.http.clone(), credential)
    }
}

/// Current wall-clock time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
