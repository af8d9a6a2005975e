//! Shared helpers for unit and integration tests: deterministic signing
//! keys, token builders, an in-memory JWKS source, and trivial tools.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand_core::OsRng;
use serde_json::{json, Value};

use crate::{
    config::ValidationPolicy,
    error::{Error, Result},
    invocation::{ProgressSender, ToolHandler},
    keyset::{JwksFetcher, KeySetCache},
    schema::{Claims, Jwk, Jwks, Tool, ToolCall, ToolInputSchema},
};

/// Initialize a tracing subscriber for tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub const TEST_ISSUER: &str = "https://login.example.com/tenant/";
pub const TEST_AUDIENCE: &str = "api://test-app";

/// PKCS#8 v1 prefix for a raw Ed25519 private key.
const ED25519_PKCS8_HEADER: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

pub fn generate_ed25519_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// JWKS entry for an Ed25519 verifying key.
pub fn jwk_for(kid: &str, key: &VerifyingKey) -> Jwk {
    Jwk {
        kty: "OKP".into(),
        kid: Some(kid.into()),
        alg: Some("EdDSA".into()),
        r#use: Some("sig".into()),
        n: None,
        e: None,
        crv: Some("Ed25519".into()),
        x: Some(URL_SAFE_NO_PAD.encode(key.as_bytes())),
    }
}

fn encoding_key(signing: &SigningKey) -> EncodingKey {
    let mut der = Vec::with_capacity(ED25519_PKCS8_HEADER.len() + 32);
    der.extend_from_slice(&ED25519_PKCS8_HEADER);
    der.extend_from_slice(signing.as_bytes());
    EncodingKey::from_ed_der(&der)
}

/// Claim-set builder for crafted tokens.
#[derive(Clone)]
pub struct TokenSpec {
    pub subject: String,
    pub issuer: String,
    pub audience: Value,
    pub expires_at: i64,
    pub not_before: Option<i64>,
    pub scopes: Option<String>,
}

impl TokenSpec {
    /// A token the default [`test_policy`] accepts.
    pub fn valid() -> Self {
        Self {
            subject: "user-1".into(),
            issuer: TEST_ISSUER.into(),
            audience: Value::String(TEST_AUDIENCE.into()),
            expires_at: Utc::now().timestamp() + 3600,
            not_before: None,
            scopes: Some("execute".into()),
        }
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = Value::String(audience.into());
        self
    }

    pub fn audience_list(mut self, audiences: Vec<String>) -> Self {
        self.audience = json!(audiences);
        self
    }

    pub fn expires_at(mut self, timestamp: i64) -> Self {
        self.expires_at = timestamp;
        self
    }

    pub fn not_before(mut self, timestamp: i64) -> Self {
        self.not_before = Some(timestamp);
        self
    }

    pub fn scopes(mut self, scopes: &str) -> Self {
        self.scopes = Some(scopes.into());
        self
    }

    fn claims(&self) -> Value {
        let mut claims = json!({
            "sub": self.subject,
            "iss": self.issuer,
            "aud": self.audience,
            "exp": self.expires_at,
            "iat": Utc::now().timestamp(),
        });
        if let Some(nbf) = self.not_before {
            claims["nbf"] = json!(nbf);
        }
        if let Some(scopes) = &self.scopes {
            claims["scp"] = json!(scopes);
        }
        claims
    }
}

/// Signs `spec` with an EdDSA header carrying `kid`.
pub fn sign_claims(signing: &SigningKey, kid: &str, spec: TokenSpec) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(kid.into());
    sign_claims_with_header(signing, header, spec)
}

pub fn sign_claims_with_header(signing: &SigningKey, header: Header, spec: TokenSpec) -> String {
    encode(&header, &spec.claims(), &encoding_key(signing)).unwrap()
}

/// Ready-to-send `Authorization` header value.
pub fn bearer(signing: &SigningKey, kid: &str, spec: TokenSpec) -> String {
    format!("Bearer {}", sign_claims(signing, kid, spec))
}

/// Policy matching [`TokenSpec::valid`].
pub fn test_policy() -> ValidationPolicy {
    ValidationPolicy::new(TEST_ISSUER, TEST_AUDIENCE).with_required_scope("execute")
}

/// Checked claims for a caller, for tests that bypass the validator.
pub fn claims_for(subject: &str) -> Claims {
    Claims {
        subject: subject.into(),
        issuer: TEST_ISSUER.into(),
        audience: vec![TEST_AUDIENCE.into()],
        scopes: BTreeSet::from(["execute".to_string()]),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        issued_at: Some(Utc::now()),
        not_before: None,
    }
}

/// In-memory JWKS source with fault injection and a fetch counter.
pub struct StaticJwksFetcher {
    keys: Mutex<Vec<Jwk>>,
    fetches: AtomicUsize,
    fail: AtomicBool,
}

impl StaticJwksFetcher {
    pub fn with_keys(keys: Vec<Jwk>) -> Self {
        Self {
            keys: Mutex::new(keys),
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_keys(&self, keys: Vec<Jwk>) {
        *self.keys.lock().unwrap() = keys;
    }

    pub fn fail_next_fetches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksFetcher for StaticJwksFetcher {
    async fn fetch(&self) -> Result<Jwks> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("jwks endpoint unavailable".into()));
        }
        Ok(Jwks {
            keys: self.keys.lock().unwrap().clone(),
        })
    }
}

/// Key-set cache backed by a static fetcher.
pub fn static_cache(keys: Vec<Jwk>) -> Arc<KeySetCache> {
    Arc::new(KeySetCache::new(Arc::new(StaticJwksFetcher::with_keys(
        keys,
    ))))
}

/// Returns its arguments, or fails when asked to.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn descriptor(&self) -> Tool {
        Tool::new("echo", ToolInputSchema::default()).with_description("Echo the arguments back")
    }

    async fn call(&self, call: &ToolCall, _progress: ProgressSender) -> Result<Value> {
        if call.arguments.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(Error::InvalidParams("asked to fail".into()));
        }
        Ok(call.arguments.clone())
    }
}

/// Emits one progress event per step, then finishes.
pub struct CountdownTool;

#[async_trait]
impl ToolHandler for CountdownTool {
    fn descriptor(&self) -> Tool {
        Tool::new(
            "countdown",
            ToolInputSchema::default()
                .with_property("steps", json!({"type": "integer"}))
                .with_required("steps"),
        )
    }

    async fn call(&self, call: &ToolCall, progress: ProgressSender) -> Result<Value> {
        let steps = call
            .arguments
            .get("steps")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::InvalidParams("steps must be an integer".into()))?;
        for step in 1..=steps {
            progress
                .send(json!({"step": step, "remaining": steps - step}))
                .await?;
        }
        Ok(json!({"steps": steps}))
    }
}

/// Never finishes on its own; only cancellation terminates it.
pub struct StallTool;

#[async_trait]
impl ToolHandler for StallTool {
    fn descriptor(&self) -> Tool {
        Tool::new("stall", ToolInputSchema::default())
    }

    async fn call(&self, _call: &ToolCall, _progress: ProgressSender) -> Result<Value> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}
