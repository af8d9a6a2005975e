//! Cache of the identity provider's published signing keys.
//!
//! A fetched key set is installed wholesale behind a lock; readers clone
//! an `Arc` snapshot and can never observe a half-updated set. Refreshes
//! are single-flight: concurrent misses trigger one fetch, with the other
//! callers re-checking the installed set once the fetch completes.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result, ValidationErrorKind},
    schema::{Jwk, Jwks},
};

/// Default time-to-live for a fetched key set (5 minutes).
///
/// Bounds how long a rotated-out provider key keeps verifying tokens, and
/// how long an unknown key id is answered from cache without a re-fetch.
pub const DEFAULT_KEYSET_TTL: Duration = Duration::from_secs(300);

/// Timeout applied to each JWKS fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A verification key from the provider's JWKS document. Immutable once
/// built; replaced only by installing a whole new [`KeySet`].
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub decoding_key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
}

/// Source of JWKS documents. Production uses [`HttpJwksFetcher`]; tests
/// substitute an in-memory implementation.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Jwks>;
}

/// Fetches the JWKS document over HTTP with a bounded timeout.
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    uri: String,
}

impl HttpJwksFetcher {
    pub fn new(jwks_uri: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            uri: jwks_uri.into(),
        })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<Jwks> {
        let response = self.client.get(&self.uri).send().await?;
        let response = response
            .error_for_status()
            .map_err(|e| Error::Transport(format!("JWKS endpoint returned {e}")))?;
        Ok(response.json::<Jwks>().await?)
    }
}

/// Caches the provider's signing keys, refreshing on TTL expiry.
///
/// Lookup misses within the TTL window are answered as unknown-key without
/// a network round-trip, so a flood of tokens signed with a bogus key id
/// cannot be used to hammer the provider.
pub struct KeySetCache {
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Duration,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh_lock: Mutex<()>,
}

impl KeySetCache {
    pub fn new(fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self::with_ttl(fetcher, DEFAULT_KEYSET_TTL)
    }

    pub fn with_ttl(fetcher: Arc<dyn JwksFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the verification key for `kid`.
    ///
    /// On a miss (or an expired set) the cache fetches a fresh document and
    /// installs it atomically. If the fetched set still lacks `kid`, the
    /// result is an `UnknownKey` validation failure, not a retryable
    /// transport error. If the provider is unreachable, a previously
    /// installed set keeps serving; with no set ever installed, validation
    /// fails closed with the transport error.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<SigningKey>> {
        if let Some(set) = self.snapshot().await {
            let fresh = set.fetched_at.elapsed() < self.ttl;
            match (set.keys.get(kid), fresh) {
                (Some(key), true) => return Ok(key.clone()),
                (None, true) => {
                    debug!(kid, "key id absent from fresh key set");
                    return Err(Error::Validation(ValidationErrorKind::UnknownKey));
                }
                // Stale set: fall through to refresh regardless of hit.
                _ => {}
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(set) = self.snapshot().await {
            if set.fetched_at.elapsed() < self.ttl {
                return set
                    .keys
                    .get(kid)
                    .cloned()
                    .ok_or(Error::Validation(ValidationErrorKind::UnknownKey));
            }
        }

        match self.fetch_and_install().await {
            Ok(set) => set
                .keys
                .get(kid)
                .cloned()
                .ok_or(Error::Validation(ValidationErrorKind::UnknownKey)),
            Err(e) => {
                if let Some(stale) = self.snapshot().await {
                    warn!(
                        error = %e,
                        age_secs = stale.fetched_at.elapsed().as_secs(),
                        "JWKS refresh failed, serving stale key set"
                    );
                    stale
                        .keys
                        .get(kid)
                        .cloned()
                        .ok_or(Error::Validation(ValidationErrorKind::UnknownKey))
                } else {
                    // No set has ever loaded: fail closed.
                    Err(e)
                }
            }
        }
    }

    /// Forces a fetch and atomic install of the provider's current keys.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_install().await.map(|_| ())
    }

    /// Number of keys in the installed set, if any.
    pub async fn key_count(&self) -> usize {
        self.snapshot().await.map_or(0, |set| set.keys.len())
    }

    async fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.read().await.clone()
    }

    async fn fetch_and_install(&self) -> Result<Arc<KeySet>> {
        let jwks = self.fetcher.fetch().await?;
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            match signing_key_from_jwk(jwk) {
                Ok(Some(key)) => {
                    keys.insert(key.kid.clone(), Arc::new(key));
                }
                Ok(None) => {
                    debug!(kty = %jwk.kty, kid = ?jwk.kid, "skipping unsupported JWKS entry");
                }
                Err(e) => {
                    warn!(kid = ?jwk.kid, error = %e, "rejecting malformed JWKS entry");
                }
            }
        }
        debug!(key_count = keys.len(), "installed fresh key set");
        let set = Arc::new(KeySet {
            keys,
            fetched_at: Instant::now(),
        });
        *self.current.write().await = Some(set.clone());
        Ok(set)
    }
}

/// Builds a [`SigningKey`] from a JWKS entry. Returns `Ok(None)` for key
/// types this crate does not verify with (e.g. `EC`), which are skipped
/// rather than rejected.
fn signing_key_from_jwk(jwk: &Jwk) -> Result<Option<SigningKey>> {
    let Some(kid) = jwk.kid.clone() else {
        return Ok(None);
    };

    match jwk.kty.as_str() {
        "RSA" => {
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                return Err(Error::InvalidConfiguration(
                    "RSA JWKS entry missing n/e members".into(),
                ));
            };
            let decoding_key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| Error::InvalidConfiguration(format!("RSA key material: {e}")))?;
            let algorithm = match jwk.alg.as_deref() {
                Some("RS384") => Algorithm::RS384,
                Some("RS512") => Algorithm::RS512,
                _ => Algorithm::RS256,
            };
            Ok(Some(SigningKey {
                kid,
                algorithm,
                decoding_key,
            }))
        }
        "OKP" => {
            if jwk.crv.as_deref() != Some("Ed25519") {
                return Ok(None);
            }
            let Some(x) = jwk.x.as_deref() else {
                return Err(Error::InvalidConfiguration(
                    "OKP JWKS entry missing x member".into(),
                ));
            };
            // Parse the raw key up front so a malformed entry is rejected
            // at install time, not on first verification.
            let bytes = URL_SAFE_NO_PAD
                .decode(x)
                .map_err(|e| Error::InvalidConfiguration(format!("Ed25519 key base64: {e}")))?;
            let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidConfiguration("Ed25519 key must be 32 bytes".into()))?;
            VerifyingKey::from_bytes(&bytes)
                .map_err(|e| Error::InvalidConfiguration(format!("invalid Ed25519 key: {e}")))?;
            let decoding_key = DecodingKey::from_ed_components(x)
                .map_err(|e| Error::InvalidConfiguration(format!("Ed25519 key material: {e}")))?;
            Ok(Some(SigningKey {
                kid,
                algorithm: Algorithm::EdDSA,
                decoding_key,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{generate_ed25519_keypair, jwk_for, StaticJwksFetcher};

    #[tokio::test]
    async fn hit_within_ttl_does_not_refetch() {
        let (_, public) = generate_ed25519_keypair();
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![jwk_for("k1", &public)]));
        let cache = KeySetCache::new(fetcher.clone());

        cache.get_key("k1").await.unwrap();
        cache.get_key("k1").await.unwrap();
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn miss_within_ttl_is_unknown_key_without_refetch() {
        let (_, public) = generate_ed25519_keypair();
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![jwk_for("k1", &public)]));
        let cache = KeySetCache::new(fetcher.clone());

        cache.get_key("k1").await.unwrap();
        let err = cache.get_key("rogue").await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownKey));
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn expired_ttl_triggers_refresh_and_picks_up_rotation() {
        let (_, old_pub) = generate_ed25519_keypair();
        let (_, new_pub) = generate_ed25519_keypair();
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![jwk_for("old", &old_pub)]));
        let cache = KeySetCache::with_ttl(fetcher.clone(), Duration::ZERO);

        cache.get_key("old").await.unwrap();
        fetcher.set_keys(vec![jwk_for("new", &new_pub)]);

        cache.get_key("new").await.unwrap();
        assert!(cache.get_key("old").await.is_err());
    }

    #[tokio::test]
    async fn fetch_failure_serves_stale_set() {
        let (_, public) = generate_ed25519_keypair();
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![jwk_for("k1", &public)]));
        let cache = KeySetCache::with_ttl(fetcher.clone(), Duration::ZERO);

        cache.get_key("k1").await.unwrap();
        fetcher.fail_next_fetches(true);

        // TTL of zero forces a refresh attempt; the stale set still serves.
        cache.get_key("k1").await.unwrap();
    }

    #[tokio::test]
    async fn fetch_failure_with_no_prior_set_fails_closed() {
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![]));
        fetcher.fail_next_fetches(true);
        let cache = KeySetCache::new(fetcher);

        let err = cache.get_key("k1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let (_, public) = generate_ed25519_keypair();
        let fetcher = Arc::new(StaticJwksFetcher::with_keys(vec![jwk_for("k1", &public)]));
        let cache = Arc::new(KeySetCache::new(fetcher.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_key("k1").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn unsupported_key_types_are_skipped() {
        let jwk = Jwk {
            kty: "EC".into(),
            kid: Some("ec-1".into()),
            alg: None,
            r#use: None,
            n: None,
            e: None,
            crv: Some("P-256".into()),
            x: None,
        };
        assert!(signing_key_from_jwk(&jwk).unwrap().is_none());
    }

    #[test]
    fn malformed_ed25519_key_is_rejected() {
        let jwk = Jwk {
            kty: "OKP".into(),
            kid: Some("bad".into()),
            alg: None,
            r#use: None,
            n: None,
            e: None,
            crv: Some("Ed25519".into()),
            x: Some("AAAA".into()),
        };
        assert!(signing_key_from_jwk(&jwk).is_err());
    }
}
