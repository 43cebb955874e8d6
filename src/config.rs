//! Broker configuration management
//!
//! Handles loading, saving, and validation of broker configuration from TOML
//! files, plus normalization of the master key's file permissions at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Broker configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,

    /// Port to listen on (default: 8001)
    pub port: u16,

    /// Path to the master private key used for session authentication
    pub ssh_key_path: PathBuf,

    /// Path of the append-only security audit log
    pub audit_log_path: PathBuf,

    /// TCP connect + handshake deadline for `open` (seconds)
    pub connect_timeout_secs: u64,

    /// Default per-command deadline for `exec` (seconds)
    pub exec_timeout_secs: u64,

    /// Idle threshold after which the reaper closes a session (seconds)
    pub session_idle_timeout_secs: u64,

    /// Interval between reaper scans (seconds)
    pub reap_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            ssh_key_path: PathBuf::from(".ssh/master_key"),
            audit_log_path: PathBuf::from("security.log"),
            connect_timeout_secs: 30,
            exec_timeout_secs: 30,
            session_idle_timeout_secs: 3600,
            reap_interval_secs: 300,
        }
    }
}

impl BrokerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Invalid port: {} (must be 1-65535)", self.port);
        }

        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be at least 1");
        }

        if self.reap_interval_secs == 0 {
            anyhow::bail!("reap_interval_secs must be at least 1");
        }

        if self.session_idle_timeout_secs == 0 {
            anyhow::bail!("session_idle_timeout_secs must be at least 1");
        }

        Ok(())
    }

    /// Default config file location (~/.config/sshbroker/config.toml)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sshbroker")
            .join("config.toml")
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, falling back to defaults if it doesn't exist
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    warn!("Failed to load config from {}: {e:#}", path.display());
                    warn!("Using default configuration");
                }
            }
        }
        Self::default()
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Normalize the master key's permissions to 0600, warning if it is absent.
    ///
    /// A missing key is not fatal: `open` falls back to the ambient SSH agent.
    pub fn normalize_key_permissions(&self) {
        if !self.ssh_key_path.exists() {
            warn!(
                key_path = %self.ssh_key_path.display(),
                "SSH master key not found - sessions will fall back to agent auth"
            );
            return;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            match std::fs::set_permissions(
                &self.ssh_key_path,
                std::fs::Permissions::from_mode(0o600),
            ) {
                Ok(()) => info!(
                    key_path = %self.ssh_key_path.display(),
                    "SSH master key permissions normalized to 0600"
                ),
                Err(e) => warn!(
                    key_path = %self.ssh_key_path.display(),
                    "Failed to set key permissions: {e}"
                ),
            }
        }
    }

    /// The key path to use for a session, or None when agent auth applies.
    pub fn key_path_if_present(&self, use_master_key: bool) -> Option<PathBuf> {
        if use_master_key && self.ssh_key_path.exists() {
            Some(self.ssh_key_path.clone())
        } else {
            None
        }
    }
}
