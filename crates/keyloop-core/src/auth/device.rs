use std::future::Future;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::oauth::{expiry_after, parse_token_response, EndpointResponse};
use super::pkce::CHALLENGE_METHOD;
use super::{AuthError, OAuthClient, PkcePair, TokenSet};

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Interval used when the device authorization response omits one (RFC 8628 §3.2).
const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Pending device authorization returned by the provider.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: Url,
    /// Verification URI with the user code already embedded, when offered.
    pub verification_uri_complete: Option<Url>,
    pub interval: StdDuration,
    pub expires_at: DateTime<Utc>,
}

impl DeviceAuthorization {
    /// URI a human (or browser launcher) should open.
    pub fn browser_uri(&self) -> &Url {
        self.verification_uri_complete
            .as_ref()
            .unwrap_or(&self.verification_uri)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn remaining(&self) -> StdDuration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default, alias = "verification_url_complete")]
    verification_uri_complete: Option<String>,
    expires_in: i64,
    #[serde(default)]
    interval: Option<u64>,
}

/// Outcome of a single poll of the token endpoint.
#[derive(Debug)]
enum PollOutcome {
    Pending,
    SlowDown,
    Authorized(TokenSet),
}

/// Runs the OAuth 2.0 device authorization grant against one provider.
#[derive(Debug, Clone)]
pub struct DeviceAuthClient {
    oauth: OAuthClient,
}

impl DeviceAuthClient {
    pub fn new(oauth: OAuthClient) -> Self {
        Self { oauth }
    }

    /// Ask the provider for a device code and user code.
    pub async fn request_device_code(
        &self,
        pkce: Option<&PkcePair>,
    ) -> Result<DeviceAuthorization, AuthError> {
        let config = self.oauth.config();
        let mut form = vec![("client_id", config.client_id.as_str())];
        if !config.scope.is_empty() {
            form.push(("scope", config.scope.as_str()));
        }
        if let Some(pkce) = pkce {
            form.push(("code_challenge", pkce.challenge()));
            form.push(("code_challenge_method", CHALLENGE_METHOD));
        }

        let url = &self.oauth.endpoints().device_authorization_url;
        let received_at = Utc::now();
        let response = self.oauth.post_form(url, &form).await?;
        if !response.status.is_success() {
            return Err(AuthError::Protocol(format!(
                "device authorization request failed: {}",
                response.describe()
            )));
        }

        let payload: DeviceCodeResponse = serde_json::from_str(&response.body).map_err(|err| {
            AuthError::Protocol(format!("malformed device authorization response: {err}"))
        })?;
        if payload.expires_in <= 0 {
            return Err(AuthError::Protocol(format!(
                "device code already expired (expires_in={})",
                payload.expires_in
            )));
        }
        let verification_uri = Url::parse(&payload.verification_uri).map_err(|err| {
            AuthError::Protocol(format!("invalid verification URI: {err}"))
        })?;
        let verification_uri_complete = payload
            .verification_uri_complete
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok());
        let expires_at = expiry_after(received_at, payload.expires_in)?;
        let interval = StdDuration::from_secs(payload.interval.unwrap_or(DEFAULT_INTERVAL_SECS))
            .max(config.min_poll_interval);

        Ok(DeviceAuthorization {
            device_code: payload.device_code,
            user_code: payload.user_code,
            verification_uri,
            verification_uri_complete,
            interval,
            expires_at,
        })
    }

    /// Poll the token endpoint until the user approves, rejects, or the code expires.
    ///
    /// Every wait and request races `cancel`; a cancelled poll returns
    /// [`AuthError::Cancelled`] and has no side effects.
    pub async fn poll_for_token(
        &self,
        device: &DeviceAuthorization,
        pkce: Option<&PkcePair>,
        cancel: &CancellationToken,
    ) -> Result<TokenSet, AuthError> {
        let mut interval = device.interval;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled);
            }
            let remaining = device.remaining();
            if remaining <= interval {
                // The next poll would land at or past expiry.
                cancellable(cancel, tokio::time::sleep(remaining)).await?;
                warn!(attempts, "device code expired before authorization completed");
                return Err(AuthError::Timeout);
            }
            cancellable(cancel, tokio::time::sleep(interval)).await?;

            attempts += 1;
            let outcome = cancellable(cancel, self.poll_once(device, pkce)).await??;
            match outcome {
                PollOutcome::Pending => {
                    debug!(attempts, "authorization pending");
                }
                PollOutcome::SlowDown => {
                    interval = interval.saturating_add(self.oauth.config().slow_down_step);
                    debug!(
                        attempts,
                        interval_ms = interval.as_millis() as u64,
                        "slowing down device polling"
                    );
                }
                PollOutcome::Authorized(token) => {
                    info!(attempts, "device authorization granted");
                    return Ok(token);
                }
            }
        }
    }

    async fn poll_once(
        &self,
        device: &DeviceAuthorization,
        pkce: Option<&PkcePair>,
    ) -> Result<PollOutcome, AuthError> {
        let config = self.oauth.config();
        let mut form = vec![
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", device.device_code.as_str()),
            ("client_id", config.client_id.as_str()),
        ];
        if let Some(pkce) = pkce {
            form.push(("code_verifier", pkce.verifier()));
        }

        let received_at = Utc::now();
        let response = self
            .oauth
            .post_form(&self.oauth.endpoints().token_url, &form)
            .await?;
        classify_poll_response(response, received_at, &config.scope)
    }
}

fn classify_poll_response(
    response: EndpointResponse,
    received_at: DateTime<Utc>,
    requested_scope: &str,
) -> Result<PollOutcome, AuthError> {
    if response.status.is_success() {
        return parse_token_response(&response.body, received_at, requested_scope)
            .map(PollOutcome::Authorized);
    }
    if response.status == StatusCode::TOO_MANY_REQUESTS {
        return Ok(PollOutcome::SlowDown);
    }

    match response.error_code() {
        Some(err) => match err.error.as_str() {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            "access_denied" => Err(AuthError::AccessDenied(response.describe())),
            "expired_token" => Err(AuthError::Timeout),
            _ => Err(AuthError::Protocol(format!(
                "device token request failed: {}",
                response.describe()
            ))),
        },
        None => Err(AuthError::Protocol(format!(
            "device token request failed with HTTP {}",
            response.status
        ))),
    }
}

pub(super) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthError::Cancelled),
        value = fut => Ok(value),
    }
}
