//! Request-level authorization in front of every server operation.
//!
//! The gate turns an optional `Authorization` header into an
//! [`AuthDecision`]. Denials carry one generic reason; the precise
//! validation kind goes to the local log only, so probing callers learn
//! nothing about which check failed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::Error,
    schema::AuthDecision,
    validator::TokenValidator,
};

/// Caller-visible reason for every token denial.
pub const DENIAL_REASON: &str = "authorization required";

pub struct AuthGate {
    validator: Arc<TokenValidator>,
}

impl AuthGate {
    pub fn new(validator: Arc<TokenValidator>) -> Self {
        Self { validator }
    }

    /// Authorizes one request from its `Authorization` header value.
    ///
    /// Accepts only the `Bearer <token>` form, scheme case-insensitive.
    /// A missing or malformed header denies without touching the
    /// validator. Infrastructure failures (an unreachable provider with
    /// no cached keys) also deny; the gate never fails open.
    pub async fn check(&self, authorization: Option<&str>) -> AuthDecision {
        let Some(header) = authorization else {
            debug!("request carried no authorization header");
            return AuthDecision::deny(DENIAL_REASON);
        };

        let Some(token) = bearer_token(header) else {
            debug!("authorization header is not a bearer credential");
            return AuthDecision::deny(DENIAL_REASON);
        };

        match self.validator.validate(token).await {
            Ok(claims) => {
                debug!(subject = %claims.subject, "request authorized");
                AuthDecision::allow(claims)
            }
            Err(Error::Validation(kind)) => {
                debug!(%kind, "token rejected");
                AuthDecision::deny(DENIAL_REASON)
            }
            Err(e) => {
                warn!(error = %e, "validation infrastructure failure, denying");
                AuthDecision::deny(DENIAL_REASON)
            }
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        generate_ed25519_keypair, jwk_for, sign_claims, static_cache, test_policy, TokenSpec,
    };

    fn gate_with_key(kid: &str) -> (AuthGate, ed25519_dalek::SigningKey) {
        let (signing, public) = generate_ed25519_keypair();
        let cache = static_cache(vec![jwk_for(kid, &public)]);
        let validator = Arc::new(TokenValidator::new(cache, test_policy()));
        (AuthGate::new(validator), signing)
    }

    #[tokio::test]
    async fn allows_valid_bearer_token() {
        let (gate, key) = gate_with_key("k1");
        let token = sign_claims(&key, "k1", TokenSpec::valid());
        let decision = gate.check(Some(&format!("Bearer {token}"))).await;
        assert!(decision.allowed);
        assert_eq!(decision.claims.unwrap().subject, "user-1");
    }

    #[tokio::test]
    async fn scheme_is_case_insensitive() {
        let (gate, key) = gate_with_key("k1");
        let token = sign_claims(&key, "k1", TokenSpec::valid());
        assert!(gate.check(Some(&format!("bearer {token}"))).await.allowed);
    }

    #[tokio::test]
    async fn denies_missing_header() {
        let (gate, _) = gate_with_key("k1");
        let decision = gate.check(None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(DENIAL_REASON));
    }

    #[tokio::test]
    async fn denies_non_bearer_scheme() {
        let (gate, _) = gate_with_key("k1");
        assert!(!gate.check(Some("Basic dXNlcjpwYXNz")).await.allowed);
        assert!(!gate.check(Some("Bearer ")).await.allowed);
        assert!(!gate.check(Some("Bearer")).await.allowed);
    }

    #[tokio::test]
    async fn denial_reason_is_uniform_across_failure_kinds() {
        let (gate, key) = gate_with_key("k1");

        let garbage = gate.check(Some("Bearer not-a-jwt")).await;
        let bad_aud = gate
            .check(Some(&format!(
                "Bearer {}",
                sign_claims(&key, "k1", TokenSpec::valid().audience("api://other"))
            )))
            .await;

        assert_eq!(garbage.denial, bad_aud.denial);
        assert!(garbage.claims.is_none());
    }
}
