//! Configuration management for fbekeyd

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default key-store root
pub const DEFAULT_BASE_DIR: &str = "/data/service/el1/public/storage_daemon/sd";

/// Default mount point the fscrypt ioctls operate on
pub const DEFAULT_DATA_MNT: &str = "/data";

/// Vendor inline-crypto-engine command node
pub const DEFAULT_FBEX_CMD_NODE: &str = "/dev/fbex_cmd";

/// Deferred-deactivation delay (milliseconds)
pub const DEFAULT_INACTIVE_DELAY_MS: u64 = 5000;

/// Key store paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-level key directories
    pub base_dir: PathBuf,

    /// Mount point for fscrypt key install/remove ioctls
    pub data_mnt: PathBuf,

    /// Recovery-key escrow directory
    pub escrow_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            data_mnt: PathBuf::from(DEFAULT_DATA_MNT),
            escrow_dir: PathBuf::from(DEFAULT_BASE_DIR).join("escrow"),
        }
    }
}

/// Hardware key store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuksConfig {
    /// Root-key file for the software HDI backend, used when the vendor
    /// HDI service is absent
    pub soft_root_key: PathBuf,

    /// Attempts per HDI call on the transient communication-failure code
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Sleep between attempts (milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_retry_max() -> u32 {
    crate::huks::MAX_RETRY_TIME
}

fn default_retry_interval_ms() -> u64 {
    crate::huks::RETRY_INTERVAL_MS
}

impl Default for HuksConfig {
    fn default() -> Self {
        HuksConfig {
            soft_root_key: PathBuf::from(DEFAULT_BASE_DIR).join("huks").join("root_key"),
            retry_max: default_retry_max(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

/// Inline-crypto-engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FbexConfig {
    /// Command character device; absence means the platform ships
    /// without the engine
    pub cmd_node: PathBuf,

    /// Force EL1 engine-key removal on inactivation
    #[serde(default)]
    pub el1_inactive: bool,
}

impl Default for FbexConfig {
    fn default() -> Self {
        FbexConfig {
            cmd_node: PathBuf::from(DEFAULT_FBEX_CMD_NODE),
            el1_inactive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub huks: HuksConfig,
    pub fbex: FbexConfig,

    /// Delay before a deferred deactivation fires (milliseconds)
    #[serde(default = "default_inactive_delay_ms")]
    pub inactive_delay_ms: u64,
}

fn default_inactive_delay_ms() -> u64 {
    DEFAULT_INACTIVE_DELAY_MS
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            huks: HuksConfig::default(),
            fbex: FbexConfig::default(),
            inactive_delay_ms: default_inactive_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable
    /// overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults when no config file exists yet (first boot)
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().is_file() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FBEKEYD_BASE_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.storage.base_dir = PathBuf::from(dir);
            }
        }
        if let Ok(mnt) = std::env::var("FBEKEYD_DATA_MNT") {
            let mnt = mnt.trim();
            if !mnt.is_empty() {
                self.storage.data_mnt = PathBuf::from(mnt);
            }
        }
        if let Ok(node) = std::env::var("FBEKEYD_FBEX_CMD_NODE") {
            let node = node.trim();
            if !node.is_empty() {
                self.fbex.cmd_node = PathBuf::from(node);
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.storage.base_dir.is_absolute() {
            return Err(Error::Config(
                "storage.base_dir must be an absolute path".to_string(),
            ));
        }
        if !self.storage.data_mnt.is_absolute() {
            return Err(Error::Config(
                "storage.data_mnt must be an absolute path".to_string(),
            ));
        }
        if self.inactive_delay_ms == 0 {
            return Err(Error::Config(
                "inactive_delay_ms must be non-zero".to_string(),
            ));
        }
        if self.huks.retry_max == 0 {
            return Err(Error::Config("huks.retry_max must be non-zero".to_string()));
        }
        Ok(())
    }
}
