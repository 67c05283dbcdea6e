use std::fmt;
use std::str::FromStr;

use super::AuthError;

/// Flow name used when an identity is given as a bare vendor.
pub const DEFAULT_FLOW: &str = "default";

/// Logical key selecting one credential file and one endpoint configuration.
///
/// Both components are limited to `[a-z0-9_]` so that the `-` joining them in
/// [`ProviderIdentity::file_stem`] can never be produced by two different identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderIdentity {
    vendor: String,
    flow: String,
}

impl ProviderIdentity {
    pub fn new(vendor: impl Into<String>, flow: impl Into<String>) -> Result<Self, AuthError> {
        let vendor = vendor.into();
        let flow = flow.into();
        validate_component(&vendor)?;
        validate_component(&flow)?;
        Ok(Self { vendor, flow })
    }

    /// Identity for a vendor's regular flow.
    pub fn standard(vendor: impl Into<String>) -> Result<Self, AuthError> {
        Self::new(vendor, DEFAULT_FLOW)
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.vendor, self.flow)
    }
}

fn validate_component(value: &str) -> Result<(), AuthError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidIdentity(value.to_owned()))
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vendor, self.flow)
    }
}

impl FromStr for ProviderIdentity {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((vendor, flow)) => Self::new(vendor, flow),
            None => Self::standard(s),
        }
    }
}
