use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::device::cancellable;
use super::{
    AuthError, ClientConfig, CredentialStore, DeviceAuthClient, DeviceAuthorization,
    LoginOptions, OAuthClient, PkcePair, ProviderIdentity, TokenManager, TokenRefresher,
    TokenSet, TokenState,
};

#[derive(Debug, Clone)]
struct Provider {
    device: DeviceAuthClient,
    refresher: TokenRefresher,
}

impl Provider {
    fn config(&self) -> &ClientConfig {
        self.refresher.oauth().config()
    }
}

/// Entry point for callers: device login, token access, and logout per identity.
///
/// Construct one instance per process and share it (e.g. behind an `Arc`) so
/// every caller goes through the same refresh serialization.
pub struct AuthClient<S> {
    tokens: TokenManager<S>,
    providers: HashMap<ProviderIdentity, Provider>,
}

impl<S> AuthClient<S>
where
    S: CredentialStore + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self::with_shared_store(Arc::new(store))
    }

    pub fn with_shared_store(store: Arc<S>) -> Self {
        Self {
            tokens: TokenManager::with_shared_store(store),
            providers: HashMap::new(),
        }
    }

    /// Register the endpoint configuration used for `identity`.
    pub fn with_provider(
        mut self,
        identity: ProviderIdentity,
        config: ClientConfig,
    ) -> Result<Self, AuthError> {
        let oauth = OAuthClient::new(config)?;
        self.providers.insert(
            identity,
            Provider {
                device: DeviceAuthClient::new(oauth.clone()),
                refresher: TokenRefresher::new(oauth),
            },
        );
        Ok(self)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderIdentity> {
        self.providers.keys()
    }

    pub fn config(&self, identity: &ProviderIdentity) -> Result<&ClientConfig, AuthError> {
        Ok(self.provider(identity)?.config())
    }

    fn provider(&self, identity: &ProviderIdentity) -> Result<&Provider, AuthError> {
        self.providers
            .get(identity)
            .ok_or_else(|| AuthError::UnknownProvider(identity.to_string()))
    }

    /// Run the device authorization flow and store the resulting tokens.
    ///
    /// `present` receives the user code and verification URI before polling
    /// starts; an error from it aborts the login. Nothing is persisted unless
    /// the flow completes.
    pub async fn login<F>(
        &self,
        identity: &ProviderIdentity,
        options: LoginOptions,
        present: F,
        cancel: &CancellationToken,
    ) -> Result<TokenSet, AuthError>
    where
        F: Fn(&DeviceAuthorization) -> Result<(), AuthError>,
    {
        let provider = self.provider(identity)?;
        let pkce = provider.config().use_pkce.then(PkcePair::generate);
        info!(identity = %identity, "starting device login");

        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        let device =
            cancellable(cancel, provider.device.request_device_code(pkce.as_ref())).await??;

        present(&device)?;

        if options.open_browser {
            if let Err(err) = open::that(device.browser_uri().as_str()) {
                warn!(identity = %identity, "failed to launch system browser: {err}");
            }
        }

        let token = provider
            .device
            .poll_for_token(&device, pkce.as_ref(), cancel)
            .await?;
        self.tokens.install(identity, token.clone()).await?;
        info!(identity = %identity, expires_at = %token.expires_at, "device login complete");
        Ok(token)
    }

    /// A currently valid access token, refreshed if needed.
    ///
    /// [`AuthError::ReauthRequired`] means the caller has to run [`AuthClient::login`].
    pub async fn access_token(&self, identity: &ProviderIdentity) -> Result<String, AuthError> {
        let provider = self.provider(identity)?;
        self.tokens
            .access_token(identity, &provider.refresher, provider.config().refresh_margin)
            .await
    }

    /// Forget cached and stored credentials. Logging out twice is not an error.
    pub async fn logout(&self, identity: &ProviderIdentity) -> Result<(), AuthError> {
        self.tokens.evict(identity).await?;
        info!(identity = %identity, "logged out");
        Ok(())
    }

    pub fn state(&self, identity: &ProviderIdentity) -> TokenState {
        self.tokens.state(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FileCredentialStore;
    use crate::config::ConfigLocator;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration as StdDuration, Instant};
    use tempfile::TempDir;
    use url::Url;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn identity() -> ProviderIdentity {
        ProviderIdentity::new("acme", "default").unwrap()
    }

    fn file_store(dir: &TempDir) -> FileCredentialStore {
        FileCredentialStore::new(ConfigLocator::with_root(dir.path().to_path_buf()).unwrap())
    }

    fn quick_config(base_url: Url) -> ClientConfig {
        ClientConfig::new(base_url, "abc")
            .with_scope("s1 s2")
            .with_polling(StdDuration::ZERO, StdDuration::from_millis(20))
    }

    fn device_code(interval: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "device_code": "D1",
            "user_code": "U1",
            "verification_url": "https://example.test/verify",
            "interval": interval,
            "expires_in": 600
        }))
    }

    fn granted() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "A1",
            "refresh_token": "R1",
            "expires_in": 3600,
            "token_type": "Bearer"
        }))
    }

    fn oauth_error(code: &str) -> ResponseTemplate {
        ResponseTemplate::new(400).set_body_json(serde_json::json!({ "error": code }))
    }

    /// Serve one device code, then answer polls in order; the last poll
    /// response keeps answering.
    async fn mount_provider(
        server: &MockServer,
        (device_path, token_path): (&str, &str),
        interval: u64,
        polls: Vec<ResponseTemplate>,
    ) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path(device_path))
            .respond_with(device_code(interval))
            .mount(server)
            .await;
        let last = polls.len().saturating_sub(1);
        for (index, response) in polls.into_iter().enumerate() {
            let mock = Mock::given(matchers::method("POST"))
                .and(matchers::path(token_path))
                .respond_with(response);
            let mock = if index < last { mock.up_to_n_times(1) } else { mock };
            mock.mount(server).await;
        }
    }

    async fn provider(interval: u64, polls: Vec<ResponseTemplate>) -> MockServer {
        let server = MockServer::start().await;
        mount_provider(&server, ("/oauth/device/code", "/oauth/token"), interval, polls).await;
        server
    }

    fn server_url(server: &MockServer) -> Url {
        Url::parse(&server.uri()).unwrap()
    }

    async fn request_paths(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| request.url.path().to_owned())
            .collect()
    }

    async fn hits(server: &MockServer) -> usize {
        request_paths(server).await.len()
    }

    #[tokio::test]
    async fn login_persists_and_serves_token() {
        let server = provider(0, vec![oauth_error("authorization_pending"), granted()]).await;
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap();

        let shown = StdMutex::new(Vec::new());
        let token = client
            .login(
                &identity(),
                LoginOptions::headless(),
                |device| {
                    shown.lock().unwrap().push(device.user_code.clone());
                    Ok(())
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(token.access_token, "A1");
        assert_eq!(*shown.lock().unwrap(), vec!["U1".to_string()]);
        assert_eq!(client.state(&identity()), TokenState::Valid);
        assert_eq!(client.access_token(&identity()).await.unwrap(), "A1");
        assert_eq!(hits(&server).await, 3);

        assert_eq!(
            request_paths(&server).await,
            vec!["/oauth/device/code", "/oauth/token", "/oauth/token"]
        );
        let stored = file_store(&dir).load(&identity()).unwrap().unwrap();
        assert_eq!(stored, token);
    }

    #[tokio::test]
    async fn example_scenario_honors_server_interval() {
        let server = provider(
            5,
            vec![
                oauth_error("authorization_pending"),
                oauth_error("authorization_pending"),
                oauth_error("authorization_pending"),
                granted(),
            ],
        )
        .await;
        let dir = TempDir::new().unwrap();
        let config = ClientConfig::new(server_url(&server), "abc").with_scope("s1 s2");
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), config)
            .unwrap();

        let started = Instant::now();
        client
            .login(
                &identity(),
                LoginOptions::headless(),
                |_| Ok(()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= StdDuration::from_secs(15));
        assert_eq!(hits(&server).await, 5);
        assert_eq!(client.state(&identity()), TokenState::Valid);
        let stored = file_store(&dir).load(&identity()).unwrap().unwrap();
        assert_eq!(stored.access_token, "A1");
        assert_eq!(stored.refresh_token.as_deref(), Some("R1"));
        assert_eq!(stored.token_type, "Bearer");
        assert_eq!(stored.scope, "s1 s2");
    }

    #[tokio::test]
    async fn cancelled_login_leaves_no_state() {
        let server = provider(1, vec![oauth_error("authorization_pending")]).await;
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = client
            .login(&identity(), LoginOptions::headless(), |_| Ok(()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(err.recovery(), crate::auth::Recovery::Cancelled);
        assert_eq!(client.state(&identity()), TokenState::Empty);
        assert!(file_store(&dir).load(&identity()).unwrap().is_none());
        assert_eq!(hits(&server).await, 1);
    }

    #[tokio::test]
    async fn denied_login_stores_nothing() {
        let server = provider(0, vec![oauth_error("access_denied")]).await;
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap();

        let err = client
            .login(
                &identity(),
                LoginOptions::headless(),
                |_| Ok(()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
        assert!(file_store(&dir).load(&identity()).unwrap().is_none());
    }

    #[tokio::test]
    async fn presenter_failure_aborts_before_polling() {
        let server = provider(0, vec![granted()]).await;
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap();

        let err = client
            .login(
                &identity(),
                LoginOptions::headless(),
                |_| Err(AuthError::Cancelled),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(hits(&server).await, 1);
    }

    #[tokio::test]
    async fn logout_twice_then_reauth_required() {
        let server = provider(0, vec![granted()]).await;
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap();
        client
            .login(
                &identity(),
                LoginOptions::headless(),
                |_| Ok(()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        client.logout(&identity()).await.unwrap();
        client.logout(&identity()).await.unwrap();
        assert!(file_store(&dir).load(&identity()).unwrap().is_none());
        let err = client.access_token(&identity()).await.unwrap_err();
        assert!(matches!(err, AuthError::ReauthRequired(_)));
        assert_eq!(hits(&server).await, 2);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let dir = TempDir::new().unwrap();
        let client = AuthClient::new(file_store(&dir));
        let err = client.access_token(&identity()).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownProvider(_)));
        assert!(client.providers().next().is_none());
    }

    #[tokio::test]
    async fn variants_of_one_vendor_keep_separate_credentials() {
        let server = MockServer::start().await;
        mount_provider(
            &server,
            ("/unlimited/device", "/unlimited/token"),
            0,
            vec![granted()],
        )
        .await;
        let dir = TempDir::new().unwrap();
        let unlimited = ProviderIdentity::new("acme", "unlimited").unwrap();
        let client = AuthClient::new(file_store(&dir))
            .with_provider(identity(), quick_config(server_url(&server)))
            .unwrap()
            .with_provider(
                unlimited.clone(),
                quick_config(server_url(&server)).with_paths("unlimited/device", "unlimited/token"),
            )
            .unwrap();

        client
            .login(
                &unlimited,
                LoginOptions::headless(),
                |_| Ok(()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(client.state(&unlimited), TokenState::Valid);
        assert!(matches!(
            client.access_token(&identity()).await.unwrap_err(),
            AuthError::ReauthRequired(_)
        ));
        assert_eq!(
            request_paths(&server).await,
            vec!["/unlimited/device", "/unlimited/token"]
        );
        assert_eq!(client.config(&unlimited).unwrap().client_id, "abc");
    }
}
