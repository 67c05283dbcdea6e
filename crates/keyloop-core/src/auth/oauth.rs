use std::env;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::token::BEARER;
use super::{AuthError, TokenSet};

pub const DEFAULT_BASE_URL: &str = "https://auth.keyloop.dev";
pub const DEFAULT_CLIENT_ID: &str = "keyloop-cli";
pub const DEFAULT_SCOPE: &str = "openid offline_access";
pub const DEFAULT_DEVICE_AUTHORIZATION_PATH: &str = "oauth/device/code";
pub const DEFAULT_TOKEN_PATH: &str = "oauth/token";

/// Lifetime assumed when a token response omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

const DEFAULT_USER_AGENT: &str = concat!("keyloop/", env!("CARGO_PKG_VERSION"));

/// OAuth client configuration for one provider identity.
///
/// Every field has a default; the `with_*` builders and [`ClientConfig::with_env_overrides`]
/// replace individual values. Endpoint URLs are resolved relative to `base_url`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub client_id: String,
    pub scope: String,
    pub device_authorization_path: String,
    pub token_path: String,
    /// Send a PKCE challenge with the device code request and the verifier with each poll.
    pub use_pkce: bool,
    /// Informational default model selection carried for callers; never sent.
    pub model: Option<String>,
    pub request_timeout: StdDuration,
    /// Floor applied to the server-declared polling interval.
    pub min_poll_interval: StdDuration,
    /// Added to the polling interval on `slow_down` or HTTP 429.
    pub slow_down_step: StdDuration,
    /// Additional attempts after a transient refresh failure.
    pub refresh_retries: u32,
    /// First backoff delay; doubled per retry.
    pub retry_backoff: StdDuration,
    /// Tokens expiring within this window are refreshed before use.
    pub refresh_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // Literal absolute URL; parsing cannot fail.
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            scope: DEFAULT_SCOPE.to_owned(),
            device_authorization_path: DEFAULT_DEVICE_AUTHORIZATION_PATH.to_owned(),
            token_path: DEFAULT_TOKEN_PATH.to_owned(),
            use_pkce: true,
            model: None,
            request_timeout: StdDuration::from_secs(30),
            min_poll_interval: StdDuration::from_secs(1),
            slow_down_step: StdDuration::from_secs(5),
            refresh_retries: 2,
            retry_backoff: StdDuration::from_millis(500),
            refresh_margin: Duration::seconds(60),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: Url, client_id: impl Into<String>) -> Self {
        Self {
            base_url,
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_paths(
        mut self,
        device_authorization_path: impl Into<String>,
        token_path: impl Into<String>,
    ) -> Self {
        self.device_authorization_path = device_authorization_path.into();
        self.token_path = token_path.into();
        self
    }

    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = enabled;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: StdDuration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_polling(mut self, min_interval: StdDuration, slow_down_step: StdDuration) -> Self {
        self.min_poll_interval = min_interval;
        self.slow_down_step = slow_down_step;
        self
    }

    pub fn with_refresh_policy(
        mut self,
        retries: u32,
        backoff: StdDuration,
        margin: Duration,
    ) -> Self {
        self.refresh_retries = retries;
        self.retry_backoff = backoff;
        self.refresh_margin = margin;
        self
    }

    /// Apply `<PREFIX>_BASE_URL`, `<PREFIX>_CLIENT_ID`, `<PREFIX>_SCOPE` and
    /// `<PREFIX>_MODEL` from the process environment.
    pub fn with_env_overrides(self, prefix: &str) -> Result<Self, AuthError> {
        self.with_overrides_from(prefix, |key| env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, prefix: &str, lookup: F) -> Result<Self, AuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{prefix}_{suffix}"))
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        if let Some(base_url) = get("BASE_URL") {
            self.base_url = Url::parse(&base_url)?;
        }
        if let Some(client_id) = get("CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(scope) = get("SCOPE") {
            self.scope = scope;
        }
        if let Some(model) = get("MODEL") {
            self.model = Some(model);
        }
        Ok(self)
    }

    /// Resolve the device authorization and token endpoints against `base_url`.
    pub fn endpoints(&self) -> Result<OAuthEndpoints, AuthError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(OAuthEndpoints {
            device_authorization_url: base
                .join(self.device_authorization_path.trim_start_matches('/'))?,
            token_url: base.join(self.token_path.trim_start_matches('/'))?,
        })
    }
}

/// Endpoints used by the device and refresh grants.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub device_authorization_url: Url,
    pub token_url: Url,
}

/// HTTP plumbing shared by the device authorization client and the token refresher.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: ClientConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: ClientConfig) -> Result<Self, AuthError> {
        let endpoints = config.endpoints()?;
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// POST a form body and hand back the raw status and body text.
    pub(crate) async fn post_form(
        &self,
        url: &Url,
        form: &[(&str, &str)],
    ) -> Result<EndpointResponse, AuthError> {
        let response = self.http.post(url.clone()).form(form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(url = %url, status = status.as_u16(), "oauth endpoint responded");
        Ok(EndpointResponse { status, body })
    }
}

/// Raw token/device endpoint reply, before interpretation.
#[derive(Debug)]
pub(crate) struct EndpointResponse {
    pub status: StatusCode,
    pub body: String,
}

impl EndpointResponse {
    /// The RFC 6749 `error` code carried by a failed response, if any.
    pub fn error_code(&self) -> Option<ErrorResponse> {
        serde_json::from_str::<ErrorResponse>(&self.body).ok()
    }

    pub fn describe(&self) -> String {
        match self.error_code() {
            Some(err) => match err.error_description {
                Some(description) => format!("{} ({description})", err.error),
                None => err.error,
            },
            None => format!("HTTP {}", self.status),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Interpret a successful token endpoint body.
///
/// `fallback_scope` is used when the server omits `scope`, which per RFC 6749
/// means the granted scope equals the requested one.
pub(crate) fn parse_token_response(
    body: &str,
    received_at: DateTime<Utc>,
    fallback_scope: &str,
) -> Result<TokenSet, AuthError> {
    let payload: TokenResponse = serde_json::from_str(body)
        .map_err(|err| AuthError::Protocol(format!("malformed token response: {err}")))?;

    if !payload.token_type.eq_ignore_ascii_case(BEARER) {
        return Err(AuthError::Protocol(format!(
            "unsupported token type '{}'",
            payload.token_type
        )));
    }
    if payload.access_token.is_empty() {
        return Err(AuthError::Protocol("empty access token".into()));
    }

    let lifetime = payload.expires_in.unwrap_or_else(|| {
        debug!("token response omitted expires_in; assuming default lifetime");
        DEFAULT_TOKEN_LIFETIME_SECS
    });
    if lifetime < 0 {
        return Err(AuthError::Protocol(format!("negative expires_in ({lifetime})")));
    }

    Ok(TokenSet {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token.filter(|value| !value.is_empty()),
        expires_at: expiry_after(received_at, lifetime)?,
        token_type: BEARER.to_owned(),
        scope: payload
            .scope
            .unwrap_or_else(|| fallback_scope.to_owned()),
    })
}

/// `received_at + expires_in` seconds, rejecting lifetimes chrono cannot represent.
pub(crate) fn expiry_after(
    received_at: DateTime<Utc>,
    expires_in: i64,
) -> Result<DateTime<Utc>, AuthError> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| received_at.checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::Protocol(format!("expires_in out of range ({expires_in})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_base_path() {
        let config = ClientConfig::new(Url::parse("https://example.test/api").unwrap(), "abc");
        let endpoints = config.endpoints().unwrap();
        assert_eq!(
            endpoints.device_authorization_url.as_str(),
            "https://example.test/api/oauth/device/code"
        );
        assert_eq!(endpoints.token_url.as_str(), "https://example.test/api/oauth/token");
    }

    #[test]
    fn endpoints_accept_leading_slash_paths() {
        let config = ClientConfig::new(Url::parse("https://example.test").unwrap(), "abc")
            .with_paths("/device", "/token");
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.device_authorization_url.as_str(), "https://example.test/device");
        assert_eq!(endpoints.token_url.as_str(), "https://example.test/token");
    }

    #[test]
    fn overrides_replace_only_given_values() {
        let config = ClientConfig::default()
            .with_overrides_from("ACME", |key| match key {
                "ACME_BASE_URL" => Some("https://example.test".into()),
                "ACME_SCOPE" => Some("s1 s2".into()),
                "ACME_CLIENT_ID" => Some("  ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.base_url.as_str(), "https://example.test/");
        assert_eq!(config.scope, "s1 s2");
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert!(config.model.is_none());
    }

    #[test]
    fn invalid_base_url_override_is_rejected() {
        let err = ClientConfig::default()
            .with_overrides_from("ACME", |key| {
                (key == "ACME_BASE_URL").then(|| "not a url".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, AuthError::Url(_)));
    }

    #[test]
    fn token_response_defaults() {
        let now = Utc::now();
        let token = parse_token_response(
            r#"{"access_token":"A1","token_type":"bearer"}"#,
            now,
            "s1 s2",
        )
        .unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.scope, "s1 s2");
        assert!(token.refresh_token.is_none());
        assert_eq!(
            token.expires_at,
            now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS)
        );
    }

    #[test]
    fn token_response_rejects_other_token_types() {
        let err = parse_token_response(
            r#"{"access_token":"A1","token_type":"mac","expires_in":60}"#,
            Utc::now(),
            "",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }

    #[test]
    fn token_response_with_huge_lifetime_is_protocol_error() {
        for expires_in in [i64::MAX, 9_223_372_036_854_775, 400_000_000_000] {
            let body = format!(
                r#"{{"access_token":"A1","token_type":"Bearer","expires_in":{expires_in}}}"#
            );
            let err = parse_token_response(&body, Utc::now(), "").unwrap_err();
            assert!(matches!(err, AuthError::Protocol(_)), "{expires_in}: {err:?}");
        }
    }

    #[test]
    fn token_response_with_negative_lifetime_is_protocol_error() {
        let err = parse_token_response(
            r#"{"access_token":"A1","token_type":"Bearer","expires_in":-5}"#,
            Utc::now(),
            "",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn default_config_uses_builtin_endpoints() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url.as_str(), "https://auth.keyloop.dev/");
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.token_url.as_str(), "https://auth.keyloop.dev/oauth/token");
    }

    #[test]
    fn token_response_requires_access_token() {
        let err = parse_token_response(r#"{"token_type":"Bearer"}"#, Utc::now(), "").unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }
}
