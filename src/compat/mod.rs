//! Container engine integration: registering the AMD runtime with the
//! engines that launch it.

pub mod docker;

use crate::error::EngineConfigError;
use std::path::Path;

pub use docker::DockerDaemonConfig;

/// Name the AMD runtime is registered under.
pub const AMD_RUNTIME_NAME: &str = "amd";
/// Executable the engine invokes for the AMD runtime.
pub const AMD_RUNTIME_EXECUTABLE: &str = "amd-container-runtime";
pub const DEFAULT_ENGINE: &str = "docker";

/// An engine configuration document that can carry runtime registrations.
pub trait RuntimeEngineConfig {
    /// Register `name` -> `path`, enable CDI and optionally make it the default.
    fn configure_runtime(&mut self, name: &str, path: &str, set_as_default: bool) -> Result<(), EngineConfigError>;

    /// Drop any default runtime setting.
    fn unset_default_runtime(&mut self) -> Result<(), EngineConfigError>;

    fn remove_runtime(&mut self, name: &str) -> Result<(), EngineConfigError>;

    /// Persist to `path`. Returns the number of bytes written.
    fn save(&self, path: &Path) -> Result<usize, EngineConfigError>;
}

/// Load the configuration of the engine called `engine` from `path`.
pub fn load_engine_config(engine: &str, path: &Path) -> Result<Box<dyn RuntimeEngineConfig>, EngineConfigError> {
    match engine {
        "docker" => Ok(Box::new(DockerDaemonConfig::load(path)?)),
        other => Err(EngineConfigError::UnsupportedEngine(other.to_string())),
    }
}
