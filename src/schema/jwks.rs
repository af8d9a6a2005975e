use serde::{Deserialize, Serialize};

/// The provider's published key document, as returned by the JWKS endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A single published key. Only the members this crate consumes are
/// modeled; unrecognized members are ignored on deserialization.
///
/// Supported key types: `RSA` (via `n`/`e`) and `OKP`/`Ed25519` (via `x`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#use: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// OKP curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// OKP public key, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rsa_jwks_document() {
        let doc = serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": "key-1",
                "use": "sig",
                "alg": "RS256",
                "n": "sXchQ",
                "e": "AQAB",
                "x5c": ["ignored-member"]
            }]
        });
        let jwks: Jwks = serde_json::from_value(doc).unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("key-1"));
        assert_eq!(jwks.keys[0].e.as_deref(), Some("AQAB"));
    }

    #[test]
    fn parses_okp_jwk() {
        let doc = serde_json::json!({
            "keys": [{"kty": "OKP", "kid": "ed-1", "crv": "Ed25519", "x": "abc"}]
        });
        let jwks: Jwks = serde_json::from_value(doc).unwrap();
        assert_eq!(jwks.keys[0].crv.as_deref(), Some("Ed25519"));
    }
}
