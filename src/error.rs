use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Toolkit-wide error type
#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("GPU discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("GPU tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("CDI error: {0}")]
    Cdi(#[from] CdiError),

    #[error("Container engine config error: {0}")]
    Engine(#[from] EngineConfigError),

    #[cfg(feature = "oci-runtime")]
    #[error("OCI error: {0}")]
    Oci(#[from] OciError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("amdgpu driver unavailable at {path:?}: {source}")]
    DriverUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to enumerate {path:?}: {source}")]
    Enumeration {
        path: PathBuf,
        source: walkdir::Error,
    },
}

/// A KFD topology node that could not be used. Never propagated: the
/// node is logged and skipped.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyParseError {
    #[error("property {key} not found")]
    MissingProperty { key: &'static str },

    #[error("property {key} has invalid value {value:?}")]
    InvalidProperty { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Acquiring lock {path:?} timed out after {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Failed to acquire lock {path:?}: {source}")]
    LockAcquisition {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to {action} {path:?}: {source}")]
    FileIo {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode tracker state {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("GPUs info is invalid. Please reset GPU Tracker.")]
    ConsistencyMismatch,

    #[error("GPUs {gpus:?} are exclusive and already in use")]
    GpusUnavailable { gpus: Vec<usize> },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Panic in {operation}: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum CdiError {
    #[error("Failed to {action} CDI spec {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed CDI spec {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Error, Debug)]
pub enum EngineConfigError {
    #[error("Unsupported runtime engine: {0}")]
    UnsupportedEngine(String),

    #[error("{path:?} is a directory")]
    IsDirectory { path: PathBuf },

    #[error("Failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Error decoding configuration file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Configuration file {path:?} is not a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("\"{key}\" in the engine configuration is not a JSON object")]
    InvalidSection { key: &'static str },
}

#[cfg(feature = "oci-runtime")]
#[derive(Error, Debug)]
pub enum OciError {
    #[error("No bundle path was passed to the runtime")]
    MissingBundle,

    #[error("No container id was passed to the runtime")]
    MissingContainerId,

    #[error("Failed to {action} OCI spec {path:?}: {source}")]
    Spec {
        action: &'static str,
        path: PathBuf,
        source: oci_spec::OciSpecError,
    },

    #[error("Failed to build OCI {what}: {message}")]
    Build { what: String, message: String },

    #[error("Failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Convenience type alias for toolkit results
pub type Result<T, E = ToolkitError> = std::result::Result<T, E>;
