#![allow(dead_code)]

use amd_container_toolkit::config::TrackerConfig;
use amd_container_toolkit::error::DiscoveryError;
use amd_container_toolkit::runtime::gpu::{
    DeviceAttributeReader, DeviceAttributes, DeviceInfo, GpuDiscovery, UniqueIdIndex,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

pub const PCI_DIR: &str = "sys/module/amdgpu/drivers/pci:amdgpu";
pub const PLATFORM_DIR: &str = "sys/devices/platform";
pub const NODES_DIR: &str = "sys/class/kfd/kfd/topology/nodes";

/// A sysfs tree in a temporary directory.
pub struct FakeSysfs {
    pub dir: TempDir,
    next_node: u32,
}

impl FakeSysfs {
    /// Tree with the amdgpu driver loaded and no devices.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(PCI_DIR)).unwrap();
        Self { dir, next_node: 1 }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// PCI GPU with one card and one render node, optionally partitioned.
    pub fn add_pci_gpu(&mut self, address: &str, card: u32, render_minor: u32, unique_id: u64, partition: Option<&str>) {
        let device_dir = self.root().join(PCI_DIR).join(address);
        add_drm(&device_dir, card, render_minor);
        if let Some(mode) = partition {
            fs::write(device_dir.join("current_compute_partition"), format!("{mode}\n")).unwrap();
        }
        self.add_topology_node(render_minor, unique_id);
    }

    /// Compute partition exposed as `amdgpu_xcp_<n>`.
    pub fn add_partition(&mut self, xcp: u32, card: u32, render_minor: u32, unique_id: u64) {
        let device_dir = self.root().join(PLATFORM_DIR).join(format!("amdgpu_xcp_{xcp}"));
        add_drm(&device_dir, card, render_minor);
        self.add_topology_node(render_minor, unique_id);
    }

    pub fn add_topology_node(&mut self, render_minor: u32, unique_id: u64) {
        let node_dir = self.root().join(NODES_DIR).join(self.next_node.to_string());
        self.next_node += 1;
        fs::create_dir_all(&node_dir).unwrap();
        fs::write(
            node_dir.join("properties"),
            format!("cpu_cores_count 0\ndrm_render_minor {render_minor}\nunique_id {unique_id}\n"),
        )
        .unwrap();
    }
}

fn add_drm(device_dir: &Path, card: u32, render_minor: u32) {
    let drm = device_dir.join("drm");
    fs::create_dir_all(drm.join(format!("card{card}"))).unwrap();
    fs::create_dir_all(drm.join(format!("renderD{render_minor}"))).unwrap();
}

/// Fixed GPU list; the list can be swapped to simulate topology drift.
pub struct FixedDiscovery {
    devices: Mutex<Vec<DeviceInfo>>,
}

impl FixedDiscovery {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    pub fn replace(&self, devices: Vec<DeviceInfo>) {
        *self.devices.lock().unwrap() = devices;
    }
}

impl GpuDiscovery for FixedDiscovery {
    fn discover(&self) -> Result<Vec<DeviceInfo>, DiscoveryError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn unique_id_index(&self) -> Result<UniqueIdIndex, DiscoveryError> {
        let mut index = UniqueIdIndex::new();
        for gpu in 0..self.devices.lock().unwrap().len() {
            index.insert(format!("0x{:x}", 0xa0 + gpu), vec![gpu]);
        }
        Ok(index)
    }
}

/// `count` unpartitioned GPUs: card N and renderD(128 + N).
pub fn gpus(count: usize) -> Vec<DeviceInfo> {
    (0..count)
        .map(|i| DeviceInfo {
            drm_devices: vec![format!("/dev/dri/card{i}"), format!("/dev/dri/renderD{}", 128 + i)],
            partition_type: String::new(),
        })
        .collect()
}

/// Attributes derived from the path instead of stat: DRM nodes are major 226
/// with the trailing number as minor, anything else is major 511.
pub struct FakeReader;

impl DeviceAttributeReader for FakeReader {
    fn read_attributes(&self, path: &str) -> DeviceAttributes {
        let digits: String = path.chars().rev().take_while(char::is_ascii_digit).collect();
        let number: i64 = digits.chars().rev().collect::<String>().parse().unwrap_or(0);
        let mut attrs = DeviceAttributes::unreadable(path);
        if path.starts_with("/dev/dri/") {
            attrs.major = 226;
            attrs.minor = number;
            attrs.gid = 44;
        } else {
            attrs.major = 511;
        }
        attrs.file_mode = 0o666;
        attrs
    }
}

/// Tracker config with state and lock files inside `dir`.
pub fn tracker_config(dir: &Path) -> TrackerConfig {
    TrackerConfig {
        state_file: dir.join("gpu-tracker.json"),
        lock_file: dir.join("gpu-tracker.lock"),
        ..Default::default()
    }
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("gpu-tracker.json")
}
