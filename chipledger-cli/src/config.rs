//! Application configuration loading.

use std::{env, fs, io::ErrorKind, path::Path, path::PathBuf};

use chipledger_storage::StoreConfig;
use chipledger_sync::{HttpRemoteConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default location on disk where the CLI looks for the JSON configuration.
pub const DEFAULT_CONFIG_PATH: &str = "chipledger.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "CHIPLEDGER_CONFIG";

/// Runtime configuration. Every section is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub remote: HttpRemoteConfig,
}

impl AppConfig {
    /// Loads the configuration from `explicit`, the environment override, or
    /// the default path, falling back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(resolve_config_path);
        Self::from_path(&path)
    }

    /// Loads the configuration at `path`; a missing or malformed file yields defaults.
    pub fn from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found; using built-in defaults");
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
