//! OAuth2 device-authorization grant (RFC 8628).
//!
//! A flow is a one-way state machine: once it reaches a terminal state it
//! can only be observed, never resumed. Polling honors the provider's
//! interval, backs off on `slow_down`, and aborts promptly through a
//! [`CancellationToken`].

use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::IssuerConfig,
    error::{Error, FlowErrorKind, Result},
    schema::{DeviceAuthorizationResponse, DeviceFlowErrorCode, TokenEndpointError, TokenEndpointResponse},
};

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Backoff added to the polling interval on each `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a device flow currently stands. Transitions are one-way; the
/// four right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Device code issued, polling not yet started.
    Requested,
    /// Polling the token endpoint while the user signs in.
    Polling,
    Completed,
    Expired,
    Denied,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Completed | FlowState::Expired | FlowState::Denied | FlowState::Cancelled
        )
    }
}

/// Starts device-authorization flows against the configured provider.
pub struct DeviceFlowAuthenticator {
    client: reqwest::Client,
    config: IssuerConfig,
    scopes: Vec<String>,
}

impl DeviceFlowAuthenticator {
    pub fn new(config: IssuerConfig, scopes: Vec<String>) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            scopes,
        })
    }

    /// Requests a device code and returns a session ready to poll.
    ///
    /// The caller is responsible for surfacing the session's user code and
    /// verification URI to the person signing in.
    pub async fn start(&self) -> Result<DeviceFlowSession> {
        let scope = self.scopes.join(" ");
        let response = self
            .client
            .post(&self.config.device_authorization_endpoint)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        let response = response
            .error_for_status()
            .map_err(|e| Error::Transport(format!("device authorization request: {e}")))?;
        let authorization: DeviceAuthorizationResponse = response.json().await?;

        info!(
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            "device authorization started"
        );

        Ok(DeviceFlowSession {
            client: self.client.clone(),
            token_endpoint: self.config.token_endpoint.clone(),
            client_id: self.config.client_id.clone(),
            interval: Duration::from_secs(authorization.interval.max(1)),
            deadline: tokio::time::Instant::now()
                + Duration::from_secs(authorization.expires_in),
            state: FlowState::Requested,
            cancel: CancellationToken::new(),
            authorization,
        })
    }
}

/// One in-flight device flow.
pub struct DeviceFlowSession {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    interval: Duration,
    deadline: tokio::time::Instant,
    state: FlowState,
    cancel: CancellationToken,
    authorization: DeviceAuthorizationResponse,
}

impl DeviceFlowSession {
    pub fn user_code(&self) -> &str {
        &self.authorization.user_code
    }

    pub fn verification_uri(&self) -> &str {
        &self.authorization.verification_uri
    }

    pub fn verification_uri_complete(&self) -> Option<&str> {
        self.authorization.verification_uri_complete.as_deref()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Token that aborts the poll loop from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Polls the token endpoint until the flow terminates.
    ///
    /// Returns the token response on `Completed`; every other terminal
    /// state maps to its [`FlowErrorKind`]. Transport errors during a
    /// poll are retried on the next tick rather than failing the flow.
    pub async fn poll_until_complete(&mut self) -> Result<TokenEndpointResponse> {
        if self.state.is_terminal() {
            return Err(Error::InternalError(
                "device flow already reached a terminal state".into(),
            ));
        }
        self.state = FlowState::Polling;

        loop {
            // Wake at the next poll tick or the code's expiry, whichever
            // comes first; never poll past the deadline.
            let now = tokio::time::Instant::now();
            let wake = std::cmp::min(self.deadline, now + self.interval);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state = FlowState::Cancelled;
                    info!("device flow cancelled");
                    return Err(Error::Flow(FlowErrorKind::Cancelled));
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            if tokio::time::Instant::now() >= self.deadline {
                self.state = FlowState::Expired;
                return Err(Error::Flow(FlowErrorKind::Expired));
            }

            match self.poll_once().await {
                Ok(Some(tokens)) => {
                    self.state = FlowState::Completed;
                    info!("device flow completed");
                    return Ok(tokens);
                }
                Ok(None) => {}
                Err(e @ Error::Flow(kind)) => {
                    self.state = match kind {
                        FlowErrorKind::Expired => FlowState::Expired,
                        FlowErrorKind::Denied => FlowState::Denied,
                        FlowErrorKind::Cancelled => FlowState::Cancelled,
                    };
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "token endpoint unreachable, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One poll of the token endpoint. `Ok(None)` means keep polling.
    async fn poll_once(&mut self) -> Result<Option<TokenEndpointResponse>> {
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", DEVICE_GRANT_TYPE),
                ("device_code", self.authorization.device_code.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(Some(response.json::<TokenEndpointResponse>().await?));
        }

        if response.status() == StatusCode::BAD_REQUEST {
            let err: TokenEndpointError = response.json().await?;
            match err.error {
                DeviceFlowErrorCode::AuthorizationPending => {
                    debug!("authorization pending");
                    Ok(None)
                }
                DeviceFlowErrorCode::SlowDown => {
                    self.interval += SLOW_DOWN_STEP;
                    debug!(interval_secs = self.interval.as_secs(), "provider asked to slow down");
                    Ok(None)
                }
                DeviceFlowErrorCode::ExpiredToken => Err(Error::Flow(FlowErrorKind::Expired)),
                DeviceFlowErrorCode::AccessDenied => Err(Error::Flow(FlowErrorKind::Denied)),
                DeviceFlowErrorCode::Other => Err(Error::AuthorizationFailed(
                    err.error_description
                        .unwrap_or_else(|| "token endpoint rejected the device grant".into()),
                )),
            }
        } else {
            Err(Error::Transport(format!(
                "token endpoint returned {}",
                response.status()
            )))
        }
    }
}
