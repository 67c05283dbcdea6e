use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication and credential management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("network error: {0}; check your connection and try again")]
    Network(#[from] reqwest::Error),
    #[error("authorization server unavailable ({status}): {body}; try again shortly")]
    ServerError { status: StatusCode, body: String },
    #[error("unexpected response from authorization server: {0}")]
    Protocol(String),
    #[error("the device code expired before authorization completed; run login again")]
    Timeout,
    #[error("authorization was denied ({0}); run login again to retry")]
    AccessDenied(String),
    #[error("refresh token was rejected ({0}); run login again")]
    InvalidGrant(String),
    #[error("credential file {} is unreadable ({reason}); run login again", path.display())]
    CorruptedStore { path: PathBuf, reason: String },
    #[error("no valid credentials for '{0}'; run login again")]
    ReauthRequired(String),
    #[error("login cancelled")]
    Cancelled,
    #[error("invalid provider identity component '{0}' (expected [a-z0-9_]+)")]
    InvalidIdentity(String),
    #[error("no provider configured for '{0}'")]
    UnknownProvider(String),
}

/// What a caller should do after an [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Transient; retrying the same call later may succeed.
    Retry,
    /// The user has to go through the device login again.
    Login,
    /// The user aborted; nothing to report.
    Cancelled,
    /// Local misconfiguration or filesystem failure.
    Fatal,
}

impl AuthError {
    pub fn recovery(&self) -> Recovery {
        match self {
            AuthError::Network(_) | AuthError::ServerError { .. } => Recovery::Retry,
            AuthError::Protocol(_)
            | AuthError::Timeout
            | AuthError::AccessDenied(_)
            | AuthError::InvalidGrant(_)
            | AuthError::CorruptedStore { .. }
            | AuthError::ReauthRequired(_) => Recovery::Login,
            AuthError::Cancelled => Recovery::Cancelled,
            AuthError::Config(_)
            | AuthError::Io(_)
            | AuthError::Serde(_)
            | AuthError::Url(_)
            | AuthError::InvalidIdentity(_)
            | AuthError::UnknownProvider(_) => Recovery::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.recovery() == Recovery::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_terminal_errors() {
        assert_eq!(AuthError::Timeout.recovery(), Recovery::Login);
        assert_eq!(
            AuthError::InvalidGrant("invalid_grant".into()).recovery(),
            Recovery::Login
        );
        assert_eq!(AuthError::Cancelled.recovery(), Recovery::Cancelled);
        assert!(AuthError::ServerError {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        }
        .is_transient());
    }

    #[test]
    fn reauth_message_is_actionable() {
        let message = AuthError::ReauthRequired("acme/default".into()).to_string();
        assert!(message.contains("acme/default"));
        assert!(message.contains("run login again"));
    }
}
