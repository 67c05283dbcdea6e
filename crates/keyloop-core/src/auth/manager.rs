use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AuthError, CredentialStore, ProviderIdentity, TokenRefresher, TokenSet};

/// Observable lifecycle state of one identity's cached credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Empty,
    Valid,
    Refreshing,
    Expired,
}

#[derive(Debug, Default)]
enum Slot {
    /// Nothing known yet; the store has not been consulted.
    #[default]
    Unloaded,
    Empty,
    Cached(TokenSet),
}

#[derive(Debug, Default)]
struct Entry {
    slot: Mutex<Slot>,
    /// Expiry of the cached token, readable without waiting on `slot`.
    cached_expiry: StdMutex<Option<DateTime<Utc>>>,
    refreshing: AtomicBool,
}

impl Entry {
    fn set(&self, slot: &mut Slot, value: Slot) {
        let expiry = match &value {
            Slot::Cached(token) => Some(token.expires_at),
            Slot::Unloaded | Slot::Empty => None,
        };
        *self
            .cached_expiry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = expiry;
        *slot = value;
    }

    fn state(&self) -> TokenState {
        if self.refreshing.load(Ordering::Acquire) {
            return TokenState::Refreshing;
        }
        let expiry = *self
            .cached_expiry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match expiry {
            None => TokenState::Empty,
            Some(expires_at) if Utc::now() >= expires_at => TokenState::Expired,
            Some(_) => TokenState::Valid,
        }
    }
}

/// Holds the refreshing flag up until dropped, including when the refresh
/// future is cancelled mid-exchange.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serves cached tokens and serializes refreshes per identity.
///
/// Each identity owns an async mutex held for the whole of a refresh, so
/// concurrent callers queue behind the in-flight exchange and then read its
/// result. Across processes the store is re-read before every refresh.
pub struct TokenManager<S> {
    store: Arc<S>,
    entries: StdMutex<HashMap<ProviderIdentity, Arc<Entry>>>,
}

impl<S> TokenManager<S>
where
    S: CredentialStore + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self::with_shared_store(Arc::new(store))
    }

    pub fn with_shared_store(store: Arc<S>) -> Self {
        Self {
            store,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn entry(&self, identity: &ProviderIdentity) -> Arc<Entry> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.entry(identity.clone()).or_default().clone()
    }

    /// Return a usable access token, refreshing it first when it is expired or
    /// expires within `margin`. Never starts a device login.
    pub async fn access_token(
        &self,
        identity: &ProviderIdentity,
        refresher: &TokenRefresher,
        margin: Duration,
    ) -> Result<String, AuthError> {
        let entry = self.entry(identity);
        let mut guard = entry.slot.lock().await;

        let cached = match &*guard {
            Slot::Cached(token) if !token.will_expire_within(margin) => {
                return Ok(token.access_token.clone());
            }
            Slot::Cached(token) => Some(token.clone()),
            Slot::Unloaded | Slot::Empty => None,
        };

        // Another process may have refreshed, logged in or logged out since we last looked.
        let Some(stored) = self.load_or_absent(identity)? else {
            entry.set(&mut guard, Slot::Empty);
            return Err(AuthError::ReauthRequired(identity.to_string()));
        };
        // A refresh whose save failed is still newer than the stored copy.
        let current = match cached {
            Some(cached) if cached.expires_at > stored.expires_at => cached,
            _ => stored,
        };
        if !current.will_expire_within(margin) {
            debug!(identity = %identity, "adopted stored token");
            let access_token = current.access_token.clone();
            entry.set(&mut guard, Slot::Cached(current));
            return Ok(access_token);
        }

        entry.set(&mut guard, Slot::Cached(current.clone()));
        let _in_flight = InFlight::start(&entry.refreshing);
        debug!(identity = %identity, "refreshing access token");
        match refresher.refresh(&current).await {
            Ok(token) => {
                // Cache first: the server may already have revoked the previous refresh token.
                let saved = self.store.save(identity, &token);
                let access_token = token.access_token.clone();
                let expires_at = token.expires_at;
                entry.set(&mut guard, Slot::Cached(token));
                if let Err(err) = saved {
                    warn!(identity = %identity, error = %err, "refreshed token not persisted");
                    return Err(err);
                }
                info!(identity = %identity, expires_at = %expires_at, "access token refreshed");
                Ok(access_token)
            }
            Err(AuthError::InvalidGrant(reason)) => {
                warn!(identity = %identity, reason = %reason, "refresh token rejected");
                self.discard_rejected(identity, &current)?;
                entry.set(&mut guard, Slot::Empty);
                Err(AuthError::ReauthRequired(identity.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Make a freshly issued token the cached value and persist it.
    pub async fn install(
        &self,
        identity: &ProviderIdentity,
        token: TokenSet,
    ) -> Result<(), AuthError> {
        let entry = self.entry(identity);
        let mut guard = entry.slot.lock().await;
        let saved = self.store.save(identity, &token);
        entry.set(&mut guard, Slot::Cached(token));
        saved
    }

    /// Drop cached state and delete the stored credentials.
    pub async fn evict(&self, identity: &ProviderIdentity) -> Result<(), AuthError> {
        let entry = self.entry(identity);
        let mut guard = entry.slot.lock().await;
        entry.set(&mut guard, Slot::Empty);
        self.store.delete(identity)
    }

    /// Current state of the in-memory cache. `Refreshing` is reported only
    /// while a refresh exchange is in flight; other holders of the slot do
    /// not affect it.
    pub fn state(&self, identity: &ProviderIdentity) -> TokenState {
        self.entry(identity).state()
    }

    fn load_or_absent(&self, identity: &ProviderIdentity) -> Result<Option<TokenSet>, AuthError> {
        match self.store.load(identity) {
            Ok(token) => Ok(token),
            Err(AuthError::CorruptedStore { path, reason }) => {
                warn!(
                    identity = %identity,
                    path = %path.display(),
                    reason = %reason,
                    "ignoring unreadable credential file"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete the stored credentials only if they still carry the rejected
    /// refresh token; a newer login from another process is left alone.
    fn discard_rejected(
        &self,
        identity: &ProviderIdentity,
        rejected: &TokenSet,
    ) -> Result<(), AuthError> {
        match self.load_or_absent(identity)? {
            Some(current) if current.refresh_token == rejected.refresh_token => {
                self.store.delete(identity)
            }
            _ => Ok(()),
        }
    }
}
