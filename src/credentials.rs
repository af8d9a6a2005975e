//! Client-side credential lifecycle.
//!
//! [`CredentialManager`] hands out a usable access token, preferring the
//! in-memory credential, then the on-disk cache, then a silent refresh,
//! and only as a last resort an interactive device flow. Refreshes are
//! single-flight: concurrent callers finding a stale token contend on one
//! lock and all but the winner reuse its result.

use std::sync::Arc;

use chrono::{Duration, Utc};
use oauth2::{
    basic::{BasicClient, BasicErrorResponse},
    ClientId, EndpointNotSet, EndpointSet, RefreshToken, RequestTokenError, TokenResponse,
    TokenUrl,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientAuthConfig, IssuerConfig},
    device_flow::DeviceFlowAuthenticator,
    error::{Error, Result},
    schema::TokenEndpointResponse,
    token_cache::{CachedCredential, TokenCacheStore},
};

type RefreshClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

type RefreshError = RequestTokenError<
    oauth2::HttpClientError<reqwest::Error>,
    BasicErrorResponse,
>;

/// Surfaces the device-flow sign-in instructions to a person.
pub trait DevicePrompt: Send + Sync {
    fn show(&self, user_code: &str, verification_uri: &str);
}

/// Default prompt: log the instructions at INFO.
pub struct LogPrompt;

impl DevicePrompt for LogPrompt {
    fn show(&self, user_code: &str, verification_uri: &str) {
        info!(
            user_code,
            verification_uri, "visit the verification URI and enter the user code to sign in"
        );
    }
}

pub struct CredentialManager {
    config: ClientAuthConfig,
    store: TokenCacheStore,
    authenticator: DeviceFlowAuthenticator,
    prompt: Arc<dyn DevicePrompt>,
    oauth: RefreshClient,
    http: reqwest::Client,
    current: RwLock<Option<CachedCredential>>,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(issuer: IssuerConfig, config: ClientAuthConfig) -> Result<Self> {
        Self::with_prompt(issuer, config, Arc::new(LogPrompt))
    }

    pub fn with_prompt(
        issuer: IssuerConfig,
        config: ClientAuthConfig,
        prompt: Arc<dyn DevicePrompt>,
    ) -> Result<Self> {
        issuer.validate()?;
        if config.no_auth {
            warn!("authentication disabled, outbound requests will carry no credentials");
        }

        let token_url = TokenUrl::new(issuer.token_endpoint.clone())
            .map_err(|e| Error::InvalidConfiguration(format!("token endpoint: {e}")))?;
        let oauth = BasicClient::new(ClientId::new(issuer.client_id.clone()))
            .set_token_uri(token_url);

        // oauth2 requires redirects disabled on the HTTP client it drives.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("http client: {e}")))?;

        let authenticator = DeviceFlowAuthenticator::new(issuer, config.scopes.clone())?;
        let store = TokenCacheStore::new(&config.cache_path);

        Ok(Self {
            config,
            store,
            authenticator,
            prompt,
            oauth,
            http,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Returns a ready `Authorization` header value, or `None` when
    /// authentication is disabled by configuration.
    pub async fn auth_header(&self) -> Result<Option<String>> {
        match self.access_token().await? {
            Some(token) => Ok(Some(format!("Bearer {token}"))),
            None => Ok(None),
        }
    }

    /// Returns a fresh access token, acquiring or refreshing as needed.
    pub async fn access_token(&self) -> Result<Option<String>> {
        if self.config.no_auth {
            return Ok(None);
        }

        let margin = self.config.refresh_margin();

        if let Some(cred) = self.cached_credential().await {
            if cred.is_fresh(Utc::now(), margin) {
                return Ok(Some(cred.access_token));
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have acquired while we waited for the lock.
        if let Some(cred) = self.cached_credential().await {
            if cred.is_fresh(Utc::now(), margin) {
                return Ok(Some(cred.access_token));
            }
        }

        let stale = self.cached_credential().await;
        let credential = match stale.and_then(|c| c.refresh_token) {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(cred) => cred,
                Err(RefreshOutcome::Rejected(detail)) => {
                    // Provider rejected the grant: the refresh token is
                    // dead, drop it and fall back to interactive sign-in.
                    info!(detail, "refresh token rejected, starting device flow");
                    self.store.invalidate(&self.config.account_id).await?;
                    self.device_sign_in().await?
                }
                Err(RefreshOutcome::Transport(e)) => return Err(e),
            },
            None => self.device_sign_in().await?,
        };

        self.install(credential.clone()).await?;
        Ok(Some(credential.access_token))
    }

    /// Drops the in-memory and on-disk credential for this account.
    pub async fn sign_out(&self) -> Result<()> {
        *self.current.write().await = None;
        self.store.invalidate(&self.config.account_id).await
    }

    async fn cached_credential(&self) -> Option<CachedCredential> {
        if let Some(cred) = self.current.read().await.clone() {
            return Some(cred);
        }
        let cred = self.store.load(&self.config.account_id).await?;
        *self.current.write().await = Some(cred.clone());
        Some(cred)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<CachedCredential, RefreshOutcome> {
        debug!("refreshing access token");
        let response = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e: RefreshError| match e {
                RequestTokenError::ServerResponse(resp) => {
                    RefreshOutcome::Rejected(resp.to_string())
                }
                other => RefreshOutcome::Transport(Error::Transport(other.to_string())),
            })?;

        let expires_in = response
            .expires_in()
            .map(|d| d.as_secs())
            .unwrap_or(3600);
        Ok(CachedCredential {
            access_token: response.access_token().secret().clone(),
            // Providers may rotate the refresh token; keep the old one if
            // the response omits a replacement.
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: Utc::now() + Duration::seconds(expires_in as i64),
            scopes: self.config.scopes.clone(),
        })
    }

    async fn device_sign_in(&self) -> Result<CachedCredential> {
        let mut session = self.authenticator.start().await?;
        self.prompt
            .show(session.user_code(), session.verification_uri());
        let tokens = session.poll_until_complete().await?;
        Ok(credential_from_response(&tokens, &self.config.scopes))
    }

    async fn install(&self, credential: CachedCredential) -> Result<()> {
        self.store
            .store(&self.config.account_id, &credential)
            .await?;
        *self.current.write().await = Some(credential);
        Ok(())
    }
}

enum RefreshOutcome {
    /// The provider rejected the refresh grant; re-authentication needed.
    Rejected(String),
    /// The provider was unreachable; the grant may still be good.
    Transport(Error),
}

fn credential_from_response(
    response: &TokenEndpointResponse,
    scopes: &[String],
) -> CachedCredential {
    let granted = response
        .scope
        .as_deref()
        .map(|s| s.split_whitespace().map(str::to_string).collect::<Vec<_>>());
    CachedCredential {
        access_token: response.access_token.clone(),
        refresh_token: response.refresh_token.clone(),
        expires_at: Utc::now() + Duration::seconds(response.expires_in.unwrap_or(3600) as i64),
        scopes: granted.unwrap_or_else(|| scopes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> IssuerConfig {
        IssuerConfig {
            issuer: "https://login.example.com/tenant/".into(),
            jwks_uri: "https://login.example.com/tenant/keys".into(),
            device_authorization_endpoint: "https://login.example.com/tenant/devicecode".into(),
            token_endpoint: "https://login.example.com/tenant/token".into(),
            client_id: "client-123".into(),
        }
    }

    #[tokio::test]
    async fn no_auth_mode_yields_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientAuthConfig {
            account_id: "me".into(),
            scopes: vec!["execute".into()],
            cache_path: dir.path().join("cache.json"),
            refresh_margin_secs: 60,
            no_auth: true,
        };
        let manager = CredentialManager::new(issuer(), config).unwrap();
        assert!(manager.auth_header().await.unwrap().is_none());
    }

    #[test]
    fn credential_prefers_granted_scopes() {
        let response = TokenEndpointResponse {
            access_token: "at".into(),
            token_type: "Bearer".into(),
            expires_in: Some(120),
            refresh_token: Some("rt".into()),
            scope: Some("execute offline_access".into()),
        };
        let cred = credential_from_response(&response, &["execute".into()]);
        assert_eq!(cred.scopes, vec!["execute", "offline_access"]);
        assert_eq!(cred.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn credential_falls_back_to_requested_scopes() {
        let response = TokenEndpointResponse {
            access_token: "at".into(),
            token_type: "Bearer".into(),
            expires_in: None,
            refresh_token: None,
            scope: None,
        };
        let cred = credential_from_response(&response, &["execute".into()]);
        assert_eq!(cred.scopes, vec!["execute"]);
    }
}
