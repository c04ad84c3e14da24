use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "AMD_CTK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/amd-container-toolkit/config.toml";

/// Toolkit configuration. Every key is optional; a missing file means
/// all defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToolkitConfig {
    /// Root under which `sys/` and `dev/` are resolved.
    pub sysfs_root: PathBuf,
    pub tracker: TrackerConfig,
    pub cdi: CdiConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackerConfig {
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CdiConfig {
    pub spec_path: PathBuf,
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    pub runc_path: String,
    /// Binary invoked by the poststop hook to release reservations.
    pub hook_path: String,
    pub visible_devices_env: String,
    pub kfd_device: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
    /// Overrides the `LOGDIR` / home directory resolution.
    pub dir: Option<PathBuf>,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/"),
            tracker: TrackerConfig::default(),
            cdi: CdiConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/log/gpu-tracker.json"),
            lock_file: PathBuf::from("/var/log/gpu-tracker.lock"),
            lock_timeout_ms: 10_000,
            lock_poll_ms: 100,
        }
    }
}

impl Default for CdiConfig {
    fn default() -> Self {
        Self {
            spec_path: PathBuf::from("/var/run/cdi/amd.json"),
            kind: "amd.com/gpu".to_string(),
            version: "0.6.0".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runc_path: "runc".to_string(),
            hook_path: "/usr/bin/amd-ctk".to_string(),
            visible_devices_env: "AMD_VISIBLE_DEVICES".to_string(),
            kfd_device: "/dev/kfd".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "amd-container-runtime.log".to_string(),
            dir: None,
        }
    }
}

impl TrackerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }
}

impl ToolkitConfig {
    /// Parse a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from `explicit`, else `$AMD_CTK_CONFIG`, else the system path.
    /// Only an explicitly named file has to exist.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(PathBuf::from(path));
        }

        let system = Path::new(DEFAULT_CONFIG_PATH);
        if system.exists() {
            return Self::load(system);
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }
}
