use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

use crate::auth::ProviderIdentity;

/// Environment variable that relocates the credential directory.
pub const CONFIG_DIR_ENV: &str = "KEYLOOP_CONFIG_DIR";

/// Locates the per-user directory holding credential files.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Discover the persistent configuration directory, creating it if needed.
    ///
    /// `KEYLOOP_CONFIG_DIR` takes precedence over the platform default.
    pub fn new() -> Result<Self, ConfigError> {
        if let Some(dir) = env::var_os(CONFIG_DIR_ENV).filter(|value| !value.is_empty()) {
            return Self::with_root(PathBuf::from(dir));
        }
        let dirs =
            ProjectDirs::from("dev", "keyloop", "keyloop").ok_or(ConfigError::MissingProjectDirs)?;
        Self::with_root(dirs.config_dir().to_path_buf())
    }

    /// Use an explicit directory, creating it with owner-only permissions.
    pub fn with_root(root: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the credentials file for the given identity.
    pub fn credentials_file(&self, identity: &ProviderIdentity) -> PathBuf {
        self.root.join(format!("credentials-{}.json", identity.file_stem()))
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur when working with configuration directories.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for keyloop")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
