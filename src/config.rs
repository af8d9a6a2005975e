use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_skew_secs() -> u64 {
    60
}

fn default_refresh_margin_secs() -> u64 {
    60
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256, Algorithm::EdDSA]
}

/// Endpoints of the single configured OAuth2/OIDC identity provider.
///
/// Supplied once at startup; both halves of the crate (validation on the
/// server, acquisition on the client) point at the same issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Issuer identifier, matched against the `iss` claim verbatim.
    pub issuer: String,
    /// Where the provider publishes its signing keys.
    pub jwks_uri: String,
    /// Device-authorization endpoint for the device grant.
    pub device_authorization_endpoint: String,
    /// Token endpoint, used for device-code polling and silent refresh.
    pub token_endpoint: String,
    /// Public client id registered with the provider.
    pub client_id: String,
}

impl IssuerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("jwks_uri", &self.jwks_uri),
            ("device_authorization_endpoint", &self.device_authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
        ] {
            url::Url::parse(value)
                .map_err(|e| Error::InvalidConfiguration(format!("invalid {name}: {e}")))?;
        }
        if self.issuer.is_empty() {
            return Err(Error::InvalidConfiguration("issuer must not be empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(Error::InvalidConfiguration("client_id must not be empty".into()));
        }
        Ok(())
    }
}

/// What a presented token must satisfy to be accepted.
///
/// Immutable after startup. The validator applies these checks in a fixed
/// order; see [`TokenValidator`](crate::TokenValidator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Audience the token must be bound to.
    pub audience: String,
    /// Scopes the token must carry (superset check).
    #[serde(default)]
    pub required_scopes: BTreeSet<String>,
    /// Tolerated clock skew, in seconds, applied to `exp` and `nbf`.
    #[serde(default = "default_skew_secs")]
    pub clock_skew_secs: u64,
    /// Signature algorithms the validator will accept. A token declaring
    /// anything else is rejected before any cryptographic work.
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<Algorithm>,
}

impl ValidationPolicy {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            required_scopes: BTreeSet::new(),
            clock_skew_secs: default_skew_secs(),
            allowed_algorithms: default_algorithms(),
        }
    }

    pub fn with_required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.insert(scope.into());
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew_secs = skew.as_secs();
        self
    }

    pub fn with_allowed_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = algorithms;
        self
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs as i64)
    }
}

/// Client-side credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    /// Account the cached credential is keyed by.
    pub account_id: String,
    /// Scopes requested during acquisition.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Location of the on-disk token cache.
    pub cache_path: PathBuf,
    /// How long before expiry a cached token is considered stale, in
    /// seconds. Gives refresh a head start over the resource server's
    /// own expiry check.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Suppress the Authorization header on outbound calls entirely.
    ///
    /// Strictly an opt-in for testing against an unsecured counterpart.
    /// It is surfaced loudly at startup and is never a fallback from a
    /// failed auth attempt.
    #[serde(default)]
    pub no_auth: bool,
}

impl ClientAuthConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer_config() -> IssuerConfig {
        IssuerConfig {
            issuer: "https://login.example.com/tenant/".into(),
            jwks_uri: "https://login.example.com/tenant/discovery/keys".into(),
            device_authorization_endpoint: "https://login.example.com/tenant/devicecode".into(),
            token_endpoint: "https://login.example.com/tenant/token".into(),
            client_id: "client-123".into(),
        }
    }

    #[test]
    fn issuer_config_accepts_valid_urls() {
        assert!(issuer_config().validate().is_ok());
    }

    #[test]
    fn issuer_config_rejects_bad_url() {
        let mut config = issuer_config();
        config.jwks_uri = "not a url".into();
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn issuer_config_rejects_empty_client_id() {
        let mut config = issuer_config();
        config.client_id = String::new();
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn policy_defaults() {
        let policy: ValidationPolicy = serde_json::from_str(
            r#"{"issuer": "https://issuer", "audience": "api://app"}"#,
        )
        .unwrap();
        assert_eq!(policy.clock_skew_secs, 60);
        assert_eq!(policy.allowed_algorithms, vec![Algorithm::RS256, Algorithm::EdDSA]);
        assert!(policy.required_scopes.is_empty());
    }

    #[test]
    fn client_config_no_auth_defaults_off() {
        let config: ClientAuthConfig = serde_json::from_str(
            r#"{"account_id": "me", "cache_path": "/tmp/cache.json"}"#,
        )
        .unwrap();
        assert!(!config.no_auth);
        assert_eq!(config.refresh_margin_secs, 60);
    }
}
