/// Configuration loading from a JSON file
use crate::config::types::{BootstrapConfig, NetworkMode, PlatformPreference, Result, RunkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk bootstrap configuration. Every key is optional; missing keys keep
/// whatever the caller already had.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub mounts: Option<Vec<PathBuf>>,
    pub tty: Option<bool>,
    pub network: Option<NetworkMode>,
    pub platform: Option<PlatformPreference>,
    pub hostname: Option<String>,
    pub env: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
}

impl FileConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunkError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| RunkError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Overlay the keys present in this file onto `base`
    pub fn apply(self, mut base: BootstrapConfig) -> BootstrapConfig {
        if let Some(mounts) = self.mounts {
            base.mounts = mounts;
        }
        if let Some(tty) = self.tty {
            base.tty = tty;
        }
        if let Some(network) = self.network {
            base.network = network;
        }
        if let Some(platform) = self.platform {
            base.platform = platform;
        }
        if let Some(hostname) = self.hostname {
            base.container_id = hostname.clone();
            base.hostname = hostname;
        }
        if let Some(env) = self.env {
            base.env = env;
        }
        if let Some(args) = self.args {
            base.args = args;
        }
        base
    }
}
