use super::RuntimeEngineConfig;
use crate::error::EngineConfigError;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RUNTIMES_KEY: &str = "runtimes";
const DEFAULT_RUNTIME_KEY: &str = "default-runtime";
const FEATURES_KEY: &str = "features";
const CDI_FEATURE: &str = "cdi";

pub const DEFAULT_DAEMON_CONFIG: &str = "/etc/docker/daemon.json";

/// Docker's `daemon.json`, kept as a raw JSON object so keys this tool does
/// not manage survive a rewrite untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockerDaemonConfig {
    document: Map<String, Value>,
}

impl DockerDaemonConfig {
    /// A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self, EngineConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(EngineConfigError::IsDirectory {
                    path: path.to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("{:?} does not exist, starting from an empty config", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(EngineConfigError::Io {
                    action: "stat",
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        info!("Loading configuration from: {:?}", path);
        let raw = std::fs::read(path).map_err(|source| EngineConfigError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&raw, path)
    }

    fn from_slice(raw: &[u8], path: &Path) -> Result<Self, EngineConfigError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        match serde_json::from_slice(raw) {
            Ok(Value::Object(document)) => Ok(Self { document }),
            Ok(_) => Err(EngineConfigError::NotAnObject {
                path: path.to_path_buf(),
            }),
            Err(source) => Err(EngineConfigError::Decode {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn default_runtime(&self) -> Option<&str> {
        self.document.get(DEFAULT_RUNTIME_KEY).and_then(Value::as_str)
    }

    /// JSON with four-space indentation, as dockerd writes it.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.document.serialize(&mut serializer)?;
        Ok(out)
    }

    /// The object stored under `key`, created if absent.
    fn section(&mut self, key: &'static str) -> Result<&mut Map<String, Value>, EngineConfigError> {
        self.document
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(EngineConfigError::InvalidSection { key })
    }
}

impl RuntimeEngineConfig for DockerDaemonConfig {
    fn configure_runtime(&mut self, name: &str, path: &str, set_as_default: bool) -> Result<(), EngineConfigError> {
        self.section(RUNTIMES_KEY)?
            .insert(name.to_string(), json!({ "path": path, "args": [] }));
        self.section(FEATURES_KEY)?
            .insert(CDI_FEATURE.to_string(), Value::Bool(true));

        if set_as_default {
            self.document
                .insert(DEFAULT_RUNTIME_KEY.to_string(), Value::String(name.to_string()));
        }
        info!("🔧 Registered runtime {} -> {}", name, path);
        Ok(())
    }

    fn unset_default_runtime(&mut self) -> Result<(), EngineConfigError> {
        if let Some(previous) = self.document.remove(DEFAULT_RUNTIME_KEY) {
            info!("Removed {} as the default runtime", previous);
        }
        Ok(())
    }

    fn remove_runtime(&mut self, name: &str) -> Result<(), EngineConfigError> {
        let Some(runtimes) = self.document.get_mut(RUNTIMES_KEY) else {
            return Ok(());
        };
        let runtimes = runtimes
            .as_object_mut()
            .ok_or(EngineConfigError::InvalidSection { key: RUNTIMES_KEY })?;
        runtimes.remove(name);
        if runtimes.is_empty() {
            self.document.remove(RUNTIMES_KEY);
        }

        if self.default_runtime() == Some(name) {
            self.document.remove(DEFAULT_RUNTIME_KEY);
        }

        if let Some(Value::Object(features)) = self.document.get_mut(FEATURES_KEY) {
            features.remove(CDI_FEATURE);
            if features.is_empty() {
                self.document.remove(FEATURES_KEY);
            }
        }
        info!("Removed runtime {}", name);
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<usize, EngineConfigError> {
        let io_error = |action: &'static str, path: PathBuf| {
            move |source: std::io::Error| EngineConfigError::Io { action, path, source }
        };

        let bytes = self.to_pretty_json().map_err(|source| EngineConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error("create", parent.to_path_buf()))?;
        }
        std::fs::write(path, &bytes).map_err(io_error("write", path.to_path_buf()))?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(bytes.len())
    }
}
