//! Bearer-token validation against a fixed [`ValidationPolicy`].
//!
//! Checks run in a fixed order so a token failing several ways always
//! reports the same kind: structure, algorithm allow-list, key lookup,
//! signature, issuer, audience, time window, scopes. The allow-list runs
//! before any key material is touched, so an attacker-declared algorithm
//! never chooses the verification path.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Validation};
use tracing::debug;

use crate::{
    config::ValidationPolicy,
    error::{Error, Result, ValidationErrorKind},
    keyset::KeySetCache,
    schema::{Claims, RawClaims},
};

pub struct TokenValidator {
    keys: Arc<KeySetCache>,
    policy: ValidationPolicy,
}

impl TokenValidator {
    pub fn new(keys: Arc<KeySetCache>, policy: ValidationPolicy) -> Self {
        Self { keys, policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validates a compact JWT and returns its checked claims.
    ///
    /// Every rejection is an [`Error::Validation`] carrying the kind of
    /// the first failed check; transport errors from a key-set refresh
    /// pass through unchanged.
    pub async fn validate(&self, token: &str) -> Result<Claims> {
        self.validate_at(token, Utc::now()).await
    }

    /// Validation with an injected clock, for exercising the time window.
    pub async fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims> {
        let header =
            decode_header(token).map_err(|_| Error::Validation(ValidationErrorKind::Malformed))?;

        if !self.policy.allowed_algorithms.contains(&header.alg) {
            debug!(alg = ?header.alg, "token declared a disallowed algorithm");
            return Err(Error::Validation(ValidationErrorKind::BadSignature));
        }

        let kid = header
            .kid
            .as_deref()
            .ok_or(Error::Validation(ValidationErrorKind::Malformed))?;
        let key = self.keys.get_key(kid).await?;

        // The resolved key's algorithm must agree with the header, so a
        // token cannot pair an RSA key with an EdDSA declaration.
        if header.alg != key.algorithm {
            debug!(kid, declared = ?header.alg, expected = ?key.algorithm,
                "token algorithm does not match its signing key");
            return Err(Error::Validation(ValidationErrorKind::BadSignature));
        }

        // Signature only; temporal and audience checks run below with the
        // injected clock and the policy's skew.
        let mut validation = Validation::new(key.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<RawClaims>(token, &key.decoding_key, &validation).map_err(|e| {
            let kind = match e.kind() {
                jsonwebtoken::errors::ErrorKind::Json(_)
                | jsonwebtoken::errors::ErrorKind::Base64(_)
                | jsonwebtoken::errors::ErrorKind::Utf8(_)
                | jsonwebtoken::errors::ErrorKind::InvalidToken => ValidationErrorKind::Malformed,
                _ => ValidationErrorKind::BadSignature,
            };
            Error::Validation(kind)
        })?;
        let raw = data.claims;

        if raw.iss != self.policy.issuer {
            return Err(Error::Validation(ValidationErrorKind::BadIssuer));
        }

        if !raw.aud.contains(&self.policy.audience) {
            return Err(Error::Validation(ValidationErrorKind::BadAudience));
        }

        let skew = self.policy.clock_skew();
        let expires_at = timestamp(raw.exp)?;
        if now > expires_at + skew {
            return Err(Error::Validation(ValidationErrorKind::Expired));
        }
        let not_before = raw.nbf.map(timestamp).transpose()?;
        if let Some(nbf) = not_before {
            if now < nbf - skew {
                return Err(Error::Validation(ValidationErrorKind::NotYetValid));
            }
        }

        let scopes = raw.scopes();
        if !self.policy.required_scopes.is_subset(&scopes) {
            return Err(Error::Validation(ValidationErrorKind::InsufficientScope));
        }

        Ok(Claims {
            subject: raw.sub.clone(),
            issuer: raw.iss.clone(),
            audience: raw.aud.values(),
            scopes,
            expires_at,
            issued_at: raw.iat.map(timestamp).transpose()?,
            not_before,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(Error::Validation(ValidationErrorKind::Malformed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        generate_ed25519_keypair, jwk_for, sign_claims, static_cache, test_policy, TokenSpec,
    };

    async fn validator_with_key(kid: &str) -> (TokenValidator, ed25519_dalek::SigningKey) {
        let (signing, public) = generate_ed25519_keypair();
        let cache = static_cache(vec![jwk_for(kid, &public)]);
        (TokenValidator::new(cache, test_policy()), signing)
    }

    #[tokio::test]
    async fn accepts_well_formed_token() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "k1", TokenSpec::valid());
        let claims = validator.validate(&token).await.unwrap();
        assert_eq!(claims.subject, "user-1");
        assert!(claims.scopes.contains("execute"));
    }

    #[tokio::test]
    async fn rejects_garbage_as_malformed() {
        let (validator, _) = validator_with_key("k1").await;
        let err = validator.validate("not-a-jwt").await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::Malformed));
    }

    #[tokio::test]
    async fn rejects_missing_kid_as_malformed() {
        let (validator, key) = validator_with_key("k1").await;
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::EdDSA);
        header.kid = None;
        let token = crate::testutils::sign_claims_with_header(&key, header, TokenSpec::valid());
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::Malformed));
    }

    #[tokio::test]
    async fn rejects_unknown_kid() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "other-kid", TokenSpec::valid());
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownKey));
    }

    #[tokio::test]
    async fn rejects_wrong_key_signature() {
        let (validator, _) = validator_with_key("k1").await;
        let (rogue, _) = generate_ed25519_keypair();
        let token = sign_claims(&rogue, "k1", TokenSpec::valid());
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::BadSignature));
    }

    #[tokio::test]
    async fn rejects_disallowed_algorithm_before_key_lookup() {
        let (signing, public) = generate_ed25519_keypair();
        let cache = static_cache(vec![jwk_for("k1", &public)]);
        let policy = test_policy().with_allowed_algorithms(vec![jsonwebtoken::Algorithm::RS256]);
        let validator = TokenValidator::new(cache, policy);

        let token = sign_claims(&signing, "k1", TokenSpec::valid());
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::BadSignature));
    }

    #[tokio::test]
    async fn rejects_wrong_issuer() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "k1", TokenSpec::valid().issuer("https://rogue.example.com"));
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::BadIssuer));
    }

    #[tokio::test]
    async fn rejects_wrong_audience() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "k1", TokenSpec::valid().audience("api://other"));
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::BadAudience));
    }

    #[tokio::test]
    async fn accepts_audience_in_array_form() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "k1", TokenSpec::valid().audience_list(vec![
            "api://other".into(),
            crate::testutils::TEST_AUDIENCE.into(),
        ]));
        assert!(validator.validate(&token).await.is_ok());
    }

    #[tokio::test]
    async fn expiry_respects_skew() {
        let (validator, key) = validator_with_key("k1").await;
        let now = Utc::now();

        // Expired 30s ago: inside the 60s skew window.
        let token = sign_claims(&key, "k1", TokenSpec::valid().expires_at(now.timestamp() - 30));
        assert!(validator.validate_at(&token, now).await.is_ok());

        // Expired 120s ago: outside the window.
        let token = sign_claims(&key, "k1", TokenSpec::valid().expires_at(now.timestamp() - 120));
        let err = validator.validate_at(&token, now).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::Expired));
    }

    #[tokio::test]
    async fn not_before_respects_skew() {
        let (validator, key) = validator_with_key("k1").await;
        let now = Utc::now();

        let token = sign_claims(&key, "k1", TokenSpec::valid().not_before(now.timestamp() + 30));
        assert!(validator.validate_at(&token, now).await.is_ok());

        let token = sign_claims(&key, "k1", TokenSpec::valid().not_before(now.timestamp() + 120));
        let err = validator.validate_at(&token, now).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::NotYetValid));
    }

    #[tokio::test]
    async fn rejects_missing_scope() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(&key, "k1", TokenSpec::valid().scopes("read"));
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(
            err.validation_kind(),
            Some(ValidationErrorKind::InsufficientScope)
        );
    }

    #[tokio::test]
    async fn issuer_outranks_audience_in_error_order() {
        let (validator, key) = validator_with_key("k1").await;
        let token = sign_claims(
            &key,
            "k1",
            TokenSpec::valid()
                .issuer("https://rogue.example.com")
                .audience("api://other"),
        );
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::BadIssuer));
    }
}
