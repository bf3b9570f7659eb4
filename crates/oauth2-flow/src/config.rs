//! Per-provider configuration
//!
//! One `ProviderConfig` backs one `AuthorizationFlow`. It is validated once
//! at registration and never mutated afterwards.

use common::Secret;
use url::Url;

use crate::error::{Error, Result};

/// Punctuation allowed in provider names besides ASCII letters and digits.
///
/// Names become a literal segment of the `/oauth2/<name>/...` routes and the
/// `auth:<name>:<user>` store keys, so route syntax (`{`, `}`, `*`), path
/// and list separators (`/`, `;`, `,`) and `:` are all excluded.
const NAME_PUNCTUATION: &[char] = &['.', '_', '~', '-'];

/// Provider authorize and token endpoints.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub auth_url: String,
    pub token_url: String,
}

/// Settings for a single identity provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Unique provider name, used in routes and credential keys
    pub name: String,
    /// Public base URL of this host, e.g. `https://bot.example.com`
    pub url: String,
    pub client_id: String,
    /// Empty for public clients
    pub client_secret: Secret<String>,
    pub scopes: Vec<String>,
    pub endpoint: Endpoint,
}

impl ProviderConfig {
    /// Check required fields, the name charset and URL well-formedness.
    pub fn validate(&self) -> Result<()> {
        required("name", &self.name)?;
        required("url", &self.url)?;

        if !valid_name(&self.name) {
            return Err(Error::Configuration(format!(
                "name may only contain ASCII letters, digits and any of {}, got: {:?}",
                NAME_PUNCTUATION.iter().collect::<String>(),
                self.name
            )));
        }

        match Url::parse(&self.url) {
            Ok(u) if u.host_str().is_some_and(|h| !h.is_empty()) => {}
            _ => {
                return Err(Error::Configuration(format!(
                    "url must be a valid absolute URL, got: {}",
                    self.url
                )));
            }
        }

        for (field, value) in [
            ("endpoint.auth_url", &self.endpoint.auth_url),
            ("endpoint.token_url", &self.endpoint.token_url),
        ] {
            if Url::parse(value).is_err() {
                return Err(Error::Configuration(format!(
                    "{field} must be a valid absolute URL, got: {value:?}"
                )));
            }
        }

        Ok(())
    }

    /// Route the provider redirects back to.
    pub fn auth_path(&self) -> String {
        format!("/oauth2/{}/auth", self.name)
    }

    /// Full callback URL, sent to the provider as `redirect_uri`.
    pub fn auth_url(&self) -> String {
        format!("{}{}", self.base_url(), self.auth_path())
    }

    /// Route the login link in the user prompt points at.
    pub fn login_path(&self) -> String {
        format!("/oauth2/{}/login", self.name)
    }

    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url(), self.login_path())
    }

    fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(&c))
        && !name.chars().all(|c| c == '.')
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Configuration(format!("{field} is required")));
    }
    Ok(())
}
