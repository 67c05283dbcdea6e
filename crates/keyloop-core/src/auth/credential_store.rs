use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigLocator;

use super::{utils, AuthError, ProviderIdentity, TokenSet};

const ENVELOPE_VERSION: u32 = 1;

/// Persistence abstraction for token sets, keyed by provider identity.
pub trait CredentialStore {
    /// `Ok(None)` when nothing is stored; [`AuthError::CorruptedStore`] when the
    /// stored bytes cannot be interpreted.
    fn load(&self, identity: &ProviderIdentity) -> Result<Option<TokenSet>, AuthError>;
    fn save(&self, identity: &ProviderIdentity, token: &TokenSet) -> Result<(), AuthError>;
    /// Deleting an absent credential is not an error.
    fn delete(&self, identity: &ProviderIdentity) -> Result<(), AuthError>;
}

/// Filesystem-backed credential storage, one JSON document per identity.
///
/// Saves go through a sibling temp file and a rename, so a concurrent reader
/// in another process sees either the old document or the new one.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    locator: ConfigLocator,
}

impl FileCredentialStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    pub fn path_for(&self, identity: &ProviderIdentity) -> PathBuf {
        self.locator.credentials_file(identity)
    }

    fn write_atomic(path: &Path, payload: &str) -> Result<(), AuthError> {
        let parent = path.parent().ok_or_else(|| {
            AuthError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                "credential path has no parent directory",
            ))
        })?;
        fs::create_dir_all(parent)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = parent.join(format!(".{file_name}.tmp.{}", utils::random_suffix(12)));

        let result = Self::write_tmp(&tmp_path, payload).and_then(|()| {
            fs::rename(&tmp_path, path)?;
            Ok(())
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_tmp(tmp_path: &Path, payload: &str) -> Result<(), AuthError> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(tmp_path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, identity: &ProviderIdentity) -> Result<Option<TokenSet>, AuthError> {
        let path = self.path_for(identity);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                return Err(corrupted(path, "not valid UTF-8"))
            }
            Err(err) => return Err(err.into()),
        };
        let envelope: CredentialEnvelope =
            serde_json::from_str(&raw).map_err(|err| corrupted(path.clone(), err))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(corrupted(
                path,
                format!("unsupported version {}", envelope.version),
            ));
        }
        if envelope.identity != identity.to_string() {
            return Err(corrupted(
                path,
                format!("belongs to identity '{}'", envelope.identity),
            ));
        }
        Ok(Some(envelope.token))
    }

    fn save(&self, identity: &ProviderIdentity, token: &TokenSet) -> Result<(), AuthError> {
        let path = self.path_for(identity);
        let envelope = CredentialEnvelope {
            version: ENVELOPE_VERSION,
            identity: identity.to_string(),
            token: token.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        Self::write_atomic(&path, &payload)?;
        debug!(identity = %identity, path = %path.display(), "credentials saved");
        Ok(())
    }

    fn delete(&self, identity: &ProviderIdentity) -> Result<(), AuthError> {
        let path = self.path_for(identity);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn corrupted(path: PathBuf, reason: impl ToString) -> AuthError {
    AuthError::CorruptedStore {
        path,
        reason: reason.to_string(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialEnvelope {
    version: u32,
    identity: String,
    #[serde(flatten)]
    token: TokenSet,
}
