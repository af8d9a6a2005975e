use thiserror::Error;

/// Why a presented bearer token was rejected.
///
/// Every token failure is mapped to exactly one of these kinds before it
/// crosses a module boundary. The kinds are terminal: a denied token is
/// never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Token (or the Authorization header carrying it) is structurally
    /// invalid.
    Malformed,
    /// The token's key id is not present in the provider's key set.
    UnknownKey,
    /// Signature verification failed, or the token used an algorithm
    /// outside the configured allow-list.
    BadSignature,
    /// The `iss` claim does not match the configured issuer.
    BadIssuer,
    /// The `aud` claim does not contain the configured audience.
    BadAudience,
    /// The token expired before the current time (minus skew).
    Expired,
    /// The token's `nbf` lies in the future (beyond skew).
    NotYetValid,
    /// The token's scopes are not a superset of the required scopes.
    InsufficientScope,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationErrorKind::Malformed => "malformed token",
            ValidationErrorKind::UnknownKey => "unknown signing key",
            ValidationErrorKind::BadSignature => "bad signature",
            ValidationErrorKind::BadIssuer => "issuer mismatch",
            ValidationErrorKind::BadAudience => "audience mismatch",
            ValidationErrorKind::Expired => "token expired",
            ValidationErrorKind::NotYetValid => "token not yet valid",
            ValidationErrorKind::InsufficientScope => "insufficient scope",
        };
        f.write_str(s)
    }
}

/// Terminal outcomes of a device-authorization flow.
///
/// None of these can be resumed; the caller must start a fresh flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    /// The device code expired before the user completed sign-in.
    Expired,
    /// The user explicitly denied the authorization request.
    Denied,
    /// The caller aborted the flow.
    Cancelled,
}

impl std::fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowErrorKind::Expired => "device flow expired",
            FlowErrorKind::Denied => "authorization denied by user",
            FlowErrorKind::Cancelled => "device flow cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network failure reaching the identity provider or a peer.
    /// Retryable with backoff, unlike a validation denial.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Token validation failed: {0}")]
    Validation(ValidationErrorKind),

    #[error("Device flow failed: {0}")]
    Flow(FlowErrorKind),

    /// Token cache read/write failure. Callers treat reads as a cache
    /// miss; a failed write leaves the prior record intact.
    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// True for failures worth retrying with backoff. Validation denials
    /// and terminal flow states are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout)
    }

    /// The validation kind, if this error is a token denial.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
