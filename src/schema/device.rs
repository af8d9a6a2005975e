use serde::{Deserialize, Serialize};

/// Response from the provider's device-authorization endpoint (RFC 8628 §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code, in seconds.
    pub expires_in: u64,
    /// Minimum polling interval, in seconds. Defaults to 5 per the RFC.
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Successful token-endpoint response, for both device-code redemption
/// and refresh-token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Error response from the token endpoint (RFC 8628 §3.5). Each code maps
/// directly to one device-flow transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEndpointError {
    pub error: DeviceFlowErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFlowErrorCode {
    /// User has not completed sign-in yet; keep polling.
    AuthorizationPending,
    /// Client is polling too fast; increase the interval.
    SlowDown,
    /// Device code expired; the flow must be restarted.
    ExpiredToken,
    /// User denied the request; terminal.
    AccessDenied,
    /// Any other provider error code.
    #[serde(other)]
    Other,
}
