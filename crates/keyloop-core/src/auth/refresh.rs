use chrono::Utc;
use tracing::{debug, warn};

use super::oauth::{parse_token_response, EndpointResponse};
use super::{AuthError, OAuthClient, TokenSet};

const INVALID_GRANT: &str = "invalid_grant";

/// Exchanges refresh tokens for new access tokens.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    oauth: OAuthClient,
}

impl TokenRefresher {
    pub fn new(oauth: OAuthClient) -> Self {
        Self { oauth }
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    /// Refresh `existing`, retrying transient failures with exponential backoff.
    pub async fn refresh(&self, existing: &TokenSet) -> Result<TokenSet, AuthError> {
        let config = self.oauth.config();
        let mut attempt = 0u32;
        loop {
            match self.refresh_once(existing).await {
                Ok(token) => return Ok(token),
                Err(err) if err.is_transient() && attempt < config.refresh_retries => {
                    let delay = config.retry_backoff.saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = config.refresh_retries,
                        delay_ms = delay.as_millis() as u64,
                        "token refresh failed; retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single refresh exchange without retries.
    pub async fn refresh_once(&self, existing: &TokenSet) -> Result<TokenSet, AuthError> {
        let refresh_token = existing
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::InvalidGrant("no refresh token stored".into()))?;
        let config = self.oauth.config();
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
        ];

        let received_at = Utc::now();
        let response = self
            .oauth
            .post_form(&self.oauth.endpoints().token_url, &form)
            .await?;
        if !response.status.is_success() {
            return Err(classify_failure(response));
        }

        let mut token = parse_token_response(&response.body, received_at, &existing.scope)?;
        if token.refresh_token.is_none() {
            token.refresh_token = existing.refresh_token.clone();
        }
        debug!(
            rotated = token.refresh_token != existing.refresh_token,
            "access token refreshed"
        );
        Ok(token)
    }
}

fn classify_failure(response: EndpointResponse) -> AuthError {
    if response.status.is_server_error() {
        return AuthError::ServerError {
            status: response.status,
            body: response.body,
        };
    }
    match response.error_code() {
        Some(err) if err.error == INVALID_GRANT => AuthError::InvalidGrant(response.describe()),
        _ => AuthError::Protocol(format!("token refresh failed: {}", response.describe())),
    }
}
