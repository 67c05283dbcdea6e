//! OAuth2 device-authorization login and shared token lifecycle for terminal tools.
//!
//! [`auth::AuthClient`] is the entry point: register a [`auth::ClientConfig`] per
//! [`auth::ProviderIdentity`], call `login` to run the device flow, `access_token`
//! whenever a bearer token is needed, and `logout` to forget credentials.

pub mod auth;
pub mod config;
