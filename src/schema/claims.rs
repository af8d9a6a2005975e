use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An `aud` claim, which providers serialize as either a single string or
/// an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(a) => a == audience,
            Audience::Many(list) => list.iter().any(|a| a == audience),
        }
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            Audience::One(a) => vec![a.clone()],
            Audience::Many(list) => list.clone(),
        }
    }
}

/// Token payload exactly as it appears on the wire, prior to policy checks.
///
/// Scopes arrive as a space-separated string under either `scp` (Entra ID
/// style) or `scope` (RFC 8693 style); [`RawClaims::scopes`] accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawClaims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl RawClaims {
    pub fn scopes(&self) -> BTreeSet<String> {
        self.scp
            .as_deref()
            .or(self.scope.as_deref())
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// The verified, policy-checked attributes of an accepted token.
///
/// Produced per request by the validator and consumed by the dispatcher;
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub subject: String,
    pub issuer: String,
    pub audience: Vec<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

/// Outcome of request-level authorization.
///
/// `denial` is a generic, caller-visible reason; the precise validation
/// kind is logged locally but never leaks to the external response.
#[derive(Debug, Clone)]
pub struct AuthDecision {
    pub allowed: bool,
    pub claims: Option<Claims>,
    pub denial: Option<&'static str>,
}

impl AuthDecision {
    pub fn allow(claims: Claims) -> Self {
        Self {
            allowed: true,
            claims: Some(claims),
            denial: None,
        }
    }

    pub fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            claims: None,
            denial: Some(reason),
        }
    }
}
