use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Everything a device node entry in a container spec needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttributes {
    pub path: String,
    pub major: i64,
    pub minor: i64,
    /// Permission bits only.
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev_type: String,
    pub access: String,
    pub allow: bool,
}

impl DeviceAttributes {
    /// Attributes used when the node cannot be inspected.
    pub fn unreadable(path: &str) -> Self {
        Self {
            path: path.to_string(),
            major: 0,
            minor: 0,
            file_mode: 0,
            uid: 0,
            gid: 0,
            dev_type: "c".to_string(),
            access: "rwm".to_string(),
            allow: true,
        }
    }
}

pub trait DeviceAttributeReader: Send + Sync {
    /// Never fails; unreadable attributes are zero.
    fn read_attributes(&self, path: &str) -> DeviceAttributes;
}

/// Reads attributes with `stat(2)` on the node below `root`.
#[derive(Debug, Clone)]
pub struct SysDeviceReader {
    root: PathBuf,
}

impl SysDeviceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn host() -> Self {
        Self::new("/")
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl DeviceAttributeReader for SysDeviceReader {
    fn read_attributes(&self, path: &str) -> DeviceAttributes {
        let mut attrs = DeviceAttributes::unreadable(path);
        let host_path = self.host_path(path);

        match std::fs::metadata(&host_path) {
            Ok(meta) => {
                let rdev = meta.rdev();
                attrs.major = nix::sys::stat::major(rdev) as i64;
                attrs.minor = nix::sys::stat::minor(rdev) as i64;
                attrs.file_mode = meta.mode() & 0o7777;
                attrs.uid = meta.uid();
                attrs.gid = meta.gid();
                if rdev == 0 {
                    debug!("{:?} is not a device node", host_path);
                }
            }
            Err(err) => warn!("⚠️ Failed to stat device {:?}: {}", host_path, err),
        }

        attrs
    }
}

/// Stats every path, preserving order.
pub fn read_all(reader: &dyn DeviceAttributeReader, paths: &[impl AsRef<Path>]) -> Vec<DeviceAttributes> {
    paths
        .iter()
        .filter_map(|p| p.as_ref().to_str())
        .map(|p| reader.read_attributes(p))
        .collect()
}
