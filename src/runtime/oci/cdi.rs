use crate::config::CdiConfig;
use crate::error::CdiError;
use crate::runtime::gpu::{DeviceAttributeReader, DeviceAttributes, GpuDiscovery};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Span, debug, info, info_span, warn};

/// Container Device Interface (CDI) specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CDISpec {
    #[serde(rename = "cdiVersion")]
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CDIDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CDIDevice {
    pub name: String,
    #[serde(rename = "containerEdits")]
    pub container_edits: CDIContainerEdits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CDIContainerEdits {
    #[serde(rename = "deviceNodes", default)]
    pub device_nodes: Vec<CDIDeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CDIDeviceNode {
    pub path: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub major: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minor: i64,
    #[serde(rename = "fileMode", default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl From<DeviceAttributes> for CDIDeviceNode {
    fn from(attrs: DeviceAttributes) -> Self {
        Self {
            path: attrs.path,
            device_type: attrs.dev_type,
            major: attrs.major,
            minor: attrs.minor,
            file_mode: Some(attrs.file_mode),
            permissions: attrs.access,
            uid: Some(attrs.uid),
            gid: Some(attrs.gid),
        }
    }
}

impl CDISpec {
    /// `<kind>=<name>` for every device, as engines accept them.
    pub fn qualified_names(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| format!("{}={}", self.kind, d.name))
            .collect()
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Builds, writes and checks the CDI spec for the host's AMD GPUs.
pub struct CdiGenerator {
    discovery: Arc<dyn GpuDiscovery>,
    reader: Arc<dyn DeviceAttributeReader>,
    config: CdiConfig,
    kfd_device: String,
    span: Span,
}

impl CdiGenerator {
    pub fn new(
        config: &CdiConfig,
        kfd_device: &str,
        discovery: Arc<dyn GpuDiscovery>,
        reader: Arc<dyn DeviceAttributeReader>,
    ) -> Self {
        let span = info_span!("cdi", spec = %config.spec_path.display());
        Self {
            discovery,
            reader,
            config: config.clone(),
            kfd_device: kfd_device.to_string(),
            span,
        }
    }

    /// Target a different spec file.
    pub fn with_spec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.spec_path = path.into();
        self
    }

    pub fn spec_path(&self) -> &Path {
        &self.config.spec_path
    }

    /// One device per GPU index plus `all`. Every device ends with the KFD node.
    pub fn generate(&self) -> Result<CDISpec, CdiError> {
        let _entered = self.span.enter();
        let gpus = self.discovery.discover()?;
        let kfd = CDIDeviceNode::from(self.reader.read_attributes(&self.kfd_device));

        let mut devices = Vec::with_capacity(gpus.len() + 1);
        let mut all_nodes = Vec::new();
        for (index, gpu) in gpus.iter().enumerate() {
            let mut nodes: Vec<CDIDeviceNode> = gpu
                .drm_devices
                .iter()
                .map(|path| self.reader.read_attributes(path).into())
                .collect();
            all_nodes.extend(nodes.iter().cloned());
            nodes.push(kfd.clone());

            devices.push(CDIDevice {
                name: index.to_string(),
                container_edits: CDIContainerEdits { device_nodes: nodes },
            });
        }
        all_nodes.push(kfd);
        devices.push(CDIDevice {
            name: "all".to_string(),
            container_edits: CDIContainerEdits {
                device_nodes: all_nodes,
            },
        });

        debug!("Generated CDI spec with {} GPU devices", gpus.len());
        Ok(CDISpec {
            cdi_version: self.config.version.clone(),
            kind: self.config.kind.clone(),
            devices,
        })
    }

    pub fn write(&self, spec: &CDISpec) -> Result<(), CdiError> {
        let _entered = self.span.enter();
        let path = self.spec_path();
        let io_error = |action: &'static str| {
            move |source: std::io::Error| CdiError::Io {
                action,
                path: path.to_path_buf(),
                source,
            }
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .map_err(io_error("create directory for"))?;
        }

        let mut content = spec.to_pretty_json().map_err(|source| CdiError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        content.push('\n');
        std::fs::write(path, content).map_err(io_error("write"))?;

        info!("📝 Wrote CDI spec to {:?}", path);
        Ok(())
    }

    /// Generate and write in one step.
    pub fn generate_and_write(&self) -> Result<CDISpec, CdiError> {
        let spec = self.generate()?;
        self.write(&spec)?;
        Ok(spec)
    }

    pub fn load(&self) -> Result<CDISpec, CdiError> {
        let path = self.spec_path();
        let content = std::fs::read_to_string(path).map_err(|source| CdiError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CdiError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// True when the saved spec equals a freshly generated one.
    pub fn validate(&self) -> Result<bool, CdiError> {
        let saved = self.load()?;
        let current = self.generate()?;
        let valid = saved == current;
        if !valid {
            let _entered = self.span.enter();
            warn!("⚠️ CDI spec {:?} is out of date", self.spec_path());
        }
        Ok(valid)
    }

    /// The host's GPUs as CDI device names.
    pub fn list(&self) -> Result<DeviceListing, CdiError> {
        let gpus = self.discovery.discover()?;
        Ok(DeviceListing {
            kind: self.config.kind.clone(),
            gpus: gpus.into_iter().map(|g| g.drm_devices).collect(),
        })
    }
}

/// Output of `amd-ctk cdi list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub kind: String,
    pub gpus: Vec<Vec<String>>,
}

impl fmt::Display for DeviceListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.gpus.len() == 1 { "device" } else { "devices" };
        writeln!(f, "Found {} AMD GPU {}", self.gpus.len(), noun)?;
        if self.gpus.is_empty() {
            return Ok(());
        }

        writeln!(f, "{}=all", self.kind)?;
        for (index, nodes) in self.gpus.iter().enumerate() {
            writeln!(f, "{}={}", self.kind, index)?;
            for node in nodes.iter().filter(|n| !n.starts_with("/dev/dri/card")) {
                writeln!(f, "  {node}")?;
            }
        }
        Ok(())
    }
}
