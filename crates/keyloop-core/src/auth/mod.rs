mod credential_store;
mod device;
mod error;
mod flow;
mod identity;
mod manager;
mod oauth;
mod orchestrator;
mod pkce;
mod refresh;
mod token;
mod utils;

pub use credential_store::{CredentialStore, FileCredentialStore};
pub use device::{DeviceAuthClient, DeviceAuthorization, DEVICE_CODE_GRANT};
pub use error::{AuthError, Recovery};
pub use flow::{LoginOptions, NO_BROWSER_ENV};
pub use identity::{ProviderIdentity, DEFAULT_FLOW};
pub use manager::{TokenManager, TokenState};
pub use oauth::{
    ClientConfig, OAuthClient, OAuthEndpoints, DEFAULT_BASE_URL, DEFAULT_CLIENT_ID,
    DEFAULT_DEVICE_AUTHORIZATION_PATH, DEFAULT_SCOPE, DEFAULT_TOKEN_PATH,
};
pub use orchestrator::AuthClient;
pub use pkce::{PkcePair, CHALLENGE_METHOD};
pub use refresh::TokenRefresher;
pub use token::{TokenSet, BEARER};
