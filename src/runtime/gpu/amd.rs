//! AMD GPU discovery over sysfs.
//!
//! GPUs bound to the amdgpu driver are found under
//! `/sys/module/amdgpu/drivers/pci:amdgpu/<pci address>`; compute partitions
//! appear as `/sys/devices/platform/amdgpu_xcp_<n>`. Each directory's `drm/`
//! subdirectory names the card and render nodes, and the KFD topology links
//! render minors to the unique ID of the physical GPU.

use super::topology;
use super::{DeviceInfo, GpuDiscovery, UniqueIdIndex, display_unique_id};
use crate::error::DiscoveryError;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{Span, debug, info, info_span, warn};
use walkdir::WalkDir;

const DRIVER_DIR: &str = "sys/module/amdgpu/drivers";
const PCI_DRIVER_DIR: &str = "sys/module/amdgpu/drivers/pci:amdgpu";
const PLATFORM_DIR: &str = "sys/devices/platform";
const KFD_NODES_DIR: &str = "sys/class/kfd/kfd/topology/nodes";
const XCP_PREFIX: &str = "amdgpu_xcp_";
const PARTITION_FILE: &str = "current_compute_partition";
const DEV_DRI: &str = "/dev/dri";

static PCI_ADDRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:").expect("Invalid PCI address regex")
});

/// Discovers AMD GPUs from a sysfs tree mounted at `root`.
#[derive(Debug, Clone)]
pub struct SysfsDiscovery {
    root: PathBuf,
    span: Span,
}

/// One physical GPU: its partitions and their render minors, in discovery order.
struct GpuGroup {
    unique_id: String,
    partition_type: String,
    members: Vec<(u32, Vec<String>)>,
}

impl SysfsDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let span = info_span!("sysfs_discovery", root = %root.display());
        Self { root, span }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn check_driver(&self) -> Result<(), DiscoveryError> {
        let driver_dir = self.path(DRIVER_DIR);
        std::fs::metadata(&driver_dir)
            .map(|_| ())
            .map_err(|source| DiscoveryError::DriverUnavailable {
                path: driver_dir,
                source,
            })
    }

    /// PCI device directories followed by partition directories, each list
    /// in file-name order.
    fn device_dirs(&self) -> Result<Vec<PathBuf>, DiscoveryError> {
        let pci_dir = self.path(PCI_DRIVER_DIR);
        let mut dirs: Vec<PathBuf> = list_dir(&pci_dir)
            .map_err(|source| DiscoveryError::Enumeration {
                path: pci_dir,
                source,
            })?
            .into_iter()
            .filter(|path| file_name(path).is_some_and(|n| PCI_ADDRESS_REGEX.is_match(n)))
            .collect();

        let platform_dir = self.path(PLATFORM_DIR);
        match list_dir(&platform_dir) {
            Ok(entries) => dirs.extend(
                entries
                    .into_iter()
                    .filter(|path| file_name(path).is_some_and(|n| n.starts_with(XCP_PREFIX))),
            ),
            Err(err) => debug!("Ignoring partition directories in {:?}: {}", platform_dir, err),
        }

        Ok(dirs)
    }

    /// DRM node paths of one device directory plus its render minor.
    /// `None` when the directory exposes no render node.
    fn drm_nodes(&self, device_dir: &Path) -> Result<Option<(Vec<String>, u32)>, DiscoveryError> {
        let drm_dir = device_dir.join("drm");
        let entries = list_dir(&drm_dir).map_err(|source| DiscoveryError::Enumeration {
            path: drm_dir.clone(),
            source,
        })?;

        let mut nodes = Vec::new();
        let mut render_minor = None;
        for entry in &entries {
            let Some(name) = file_name(entry) else {
                continue;
            };
            if name.starts_with("card") {
                nodes.push(format!("{DEV_DRI}/{name}"));
            } else if let Some(minor) = name.strip_prefix("renderD") {
                nodes.push(format!("{DEV_DRI}/{name}"));
                render_minor = minor.parse::<u32>().ok();
            }
        }

        Ok(render_minor.map(|minor| (nodes, minor)))
    }

    fn scan(&self) -> Result<(Vec<DeviceInfo>, BTreeMap<u32, String>), DiscoveryError> {
        let _entered = self.span.enter();
        self.check_driver()?;

        let topology = topology::read_topology(&self.path(KFD_NODES_DIR));
        debug!("KFD topology maps {} render nodes", topology.len());

        let mut groups: Vec<GpuGroup> = Vec::new();
        for dir in self.device_dirs()? {
            let Some((nodes, render_minor)) = self.drm_nodes(&dir)? else {
                debug!("No render node under {:?}", dir);
                continue;
            };
            let Some(unique_id) = topology.get(&render_minor) else {
                debug!("Render minor {} has no topology node", render_minor);
                continue;
            };

            let partition_type = read_partition_type(&dir);
            match groups.iter_mut().find(|g| &g.unique_id == unique_id) {
                Some(group) => {
                    if group.partition_type.is_empty() {
                        group.partition_type = partition_type;
                    }
                    group.members.push((render_minor, nodes));
                }
                None => groups.push(GpuGroup {
                    unique_id: unique_id.clone(),
                    partition_type,
                    members: vec![(render_minor, nodes)],
                }),
            }
        }

        let mut devices = Vec::new();
        for mut group in groups {
            group.members.sort_by_key(|(minor, _)| *minor);
            for (_, drm_devices) in group.members {
                devices.push(DeviceInfo {
                    drm_devices,
                    partition_type: group.partition_type.clone(),
                });
            }
        }

        info!("🔍 Discovered {} AMD GPU(s)", devices.len());
        Ok((devices, topology))
    }
}

impl GpuDiscovery for SysfsDiscovery {
    fn discover(&self) -> Result<Vec<DeviceInfo>, DiscoveryError> {
        self.scan().map(|(devices, _)| devices)
    }

    fn unique_id_index(&self) -> Result<UniqueIdIndex, DiscoveryError> {
        let (devices, topology) = self.scan()?;

        let mut index = UniqueIdIndex::new();
        for (render_minor, unique_id) in &topology {
            let Some(gpu) = devices
                .iter()
                .position(|d| d.render_minor() == Some(*render_minor))
            else {
                continue;
            };
            index.entry(unique_id.clone()).or_default().push(gpu);
            index
                .entry(format!("0x{unique_id}"))
                .or_default()
                .push(gpu);
        }

        for gpus in index.values_mut() {
            gpus.sort_unstable();
        }
        debug!("Unique IDs: {:?}", index.keys().map(|id| display_unique_id(id)).collect::<Vec<_>>());
        Ok(index)
    }
}

/// Children of `dir` sorted by file name. A missing directory is empty.
fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, walkdir::Error> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.map(|e| e.into_path()))
        .collect()
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// `spx` is the unpartitioned mode and reported as empty.
fn read_partition_type(device_dir: &Path) -> String {
    match std::fs::read_to_string(device_dir.join(PARTITION_FILE)) {
        Ok(mode) => {
            let mode = mode.trim().to_ascii_lowercase();
            if mode == "spx" { String::new() } else { mode }
        }
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read partition mode under {:?}: {}", device_dir, err);
            }
            String::new()
        }
    }
}
