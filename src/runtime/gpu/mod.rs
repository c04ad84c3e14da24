use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod amd;
pub mod device;
pub mod topology;

pub use amd::SysfsDiscovery;
pub use device::{DeviceAttributeReader, DeviceAttributes, SysDeviceReader};

/// The DRM nodes of one GPU or GPU partition, as exposed to containers.
///
/// Serialized as part of the tracker state file, so the field names are
/// part of the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Absolute paths under `/dev/dri`, card node first.
    pub drm_devices: Vec<String>,
    /// Lower-case partition mode (`cpx`, `dpx`, ...); empty when unpartitioned.
    pub partition_type: String,
}

impl DeviceInfo {
    /// Minor number of the render node, taken from its `renderD<N>` name.
    pub fn render_minor(&self) -> Option<u32> {
        self.drm_devices.iter().rev().find_map(|path| {
            let name = path.rsplit('/').next()?;
            name.strip_prefix("renderD")?.parse().ok()
        })
    }
}

/// Unique ID (bare lower-case hex and `0x`-prefixed) to GPU indices.
/// A partitioned GPU maps to every partition index.
pub type UniqueIdIndex = HashMap<String, Vec<usize>>;

/// Source of the GPU topology. Implemented over sysfs for real hosts and
/// by fakes in tests.
pub trait GpuDiscovery: Send + Sync {
    /// Ordered GPU list; a GPU's index is its position.
    fn discover(&self) -> Result<Vec<DeviceInfo>, DiscoveryError>;

    fn unique_id_index(&self) -> Result<UniqueIdIndex, DiscoveryError>;
}

/// `0x` followed by the upper-case hex digits, as shown to users.
pub fn display_unique_id(unique_id: &str) -> String {
    let bare = unique_id
        .strip_prefix("0x")
        .or_else(|| unique_id.strip_prefix("0X"))
        .unwrap_or(unique_id);
    format!("0x{}", bare.to_ascii_uppercase())
}

/// Inverts a [`UniqueIdIndex`] into GPU index to display form.
pub fn unique_ids_by_gpu(index: &UniqueIdIndex) -> HashMap<usize, String> {
    let mut by_gpu = HashMap::new();
    for (unique_id, gpus) in index {
        for gpu in gpus {
            by_gpu.insert(*gpu, display_unique_id(unique_id));
        }
    }
    by_gpu
}
