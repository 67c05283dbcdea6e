use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Token type attached to every bearer token issued by the token endpoint.
pub const BEARER: &str = "Bearer";

/// Access/refresh token pair as issued by the token endpoint and persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiry")]
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

impl TokenSet {
    pub fn new_bearer(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            token_type: BEARER.to_owned(),
            scope: scope.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        Utc::now()
            .checked_add_signed(window)
            .map_or(true, |horizon| horizon >= self.expires_at)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    /// Value for an HTTP `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_detection() {
        let token = TokenSet::new_bearer(
            "token".into(),
            Some("refresh".into()),
            Utc::now() + Duration::minutes(1),
            "read",
        );
        assert!(!token.is_expired());
        assert!(token.will_expire_within(Duration::minutes(2)));
        assert!(!token.will_expire_within(Duration::seconds(10)));
    }

    #[test]
    fn past_expiry_is_expired() {
        let token =
            TokenSet::new_bearer("token".into(), None, Utc::now() - Duration::seconds(1), "");
        assert!(token.is_expired());
    }

    #[test]
    fn unbounded_window_counts_as_expiring() {
        let token = TokenSet::new_bearer("token".into(), None, Utc::now(), "");
        assert!(token.will_expire_within(Duration::days(365 * 1_000_000)));
    }

    #[test]
    fn serializes_expiry_as_rfc3339() {
        let expires_at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let token = TokenSet::new_bearer("a".into(), None, expires_at, "s1 s2");
        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["expiry"], "2026-01-02T03:04:05Z");
        assert!(value.get("refresh_token").is_none());
        assert_eq!(token.scopes().collect::<Vec<_>>(), vec!["s1", "s2"]);
        assert_eq!(token.authorization_header(), "Bearer a");
    }
}
