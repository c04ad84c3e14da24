use crate::runtime::gpu::{DeviceInfo, UniqueIdIndex, unique_ids_by_gpu};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stored as an integer: 0 shared, 1 exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Accessibility {
    #[default]
    Shared,
    Exclusive,
}

impl From<Accessibility> for u8 {
    fn from(value: Accessibility) -> Self {
        match value {
            Accessibility::Shared => 0,
            Accessibility::Exclusive => 1,
        }
    }
}

impl TryFrom<u8> for Accessibility {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Accessibility::Shared),
            1 => Ok(Accessibility::Exclusive),
            other => Err(format!("invalid accessibility value {other}")),
        }
    }
}

impl fmt::Display for Accessibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accessibility::Shared => write!(f, "Shared"),
            Accessibility::Exclusive => write!(f, "Exclusive"),
        }
    }
}

/// Per-GPU reservation record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    /// Display form of the unique ID (`0x` + upper-case hex), empty if unknown.
    pub uuid: String,
    pub partition_type: String,
    pub accessibility: Accessibility,
    /// Holders in grant order. May repeat when a container asked twice.
    #[serde(default)]
    pub container_ids: Vec<String>,
}

impl GpuStatus {
    /// Shared GPUs can always be granted; exclusive ones only while unheld.
    pub fn is_grantable(&self) -> bool {
        match self.accessibility {
            Accessibility::Shared => true,
            Accessibility::Exclusive => self.container_ids.is_empty(),
        }
    }
}

/// Persisted tracker document.
///
/// `gpus_info` is the topology snapshot taken when the state was built; any
/// operation that relies on indices first checks it against live discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    pub enabled: bool,
    #[serde(default)]
    pub gpus_status: BTreeMap<usize, GpuStatus>,
    #[serde(default)]
    pub gpus_info: BTreeMap<usize, DeviceInfo>,
}

impl TrackerState {
    /// Every GPU shared and unheld, with a fresh snapshot of `devices`.
    pub fn fresh(enabled: bool, devices: &[DeviceInfo], unique_ids: &UniqueIdIndex) -> Self {
        let display_ids = unique_ids_by_gpu(unique_ids);

        let mut gpus_status = BTreeMap::new();
        let mut gpus_info = BTreeMap::new();
        for (index, device) in devices.iter().enumerate() {
            gpus_status.insert(
                index,
                GpuStatus {
                    uuid: display_ids.get(&index).cloned().unwrap_or_default(),
                    partition_type: device.partition_type.clone(),
                    accessibility: Accessibility::Shared,
                    container_ids: Vec::new(),
                },
            );
            gpus_info.insert(index, device.clone());
        }

        Self {
            enabled,
            gpus_status,
            gpus_info,
        }
    }

    /// True when the stored snapshot equals `devices` index by index.
    pub fn snapshot_matches(&self, devices: &[DeviceInfo]) -> bool {
        self.gpus_info.len() == devices.len()
            && devices
                .iter()
                .enumerate()
                .all(|(index, device)| self.gpus_info.get(&index) == Some(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device(card: u32) -> DeviceInfo {
        DeviceInfo {
            drm_devices: vec![
                format!("/dev/dri/card{card}"),
                format!("/dev/dri/renderD{}", 128 + card),
            ],
            partition_type: String::new(),
        }
    }

    #[test]
    fn test_fresh_state() {
        let devices = vec![device(0), device(1)];
        let unique_ids = UniqueIdIndex::from([
            ("ab".to_string(), vec![0]),
            ("0xab".to_string(), vec![0]),
        ]);
        let state = TrackerState::fresh(true, &devices, &unique_ids);

        assert!(state.enabled);
        assert_eq!(state.gpus_status[&0].uuid, "0xAB");
        assert_eq!(state.gpus_status[&1].uuid, "");
        assert!(state.gpus_status.values().all(|s| s.accessibility == Accessibility::Shared));
        assert!(state.snapshot_matches(&devices));
    }

    #[test]
    fn test_snapshot_mismatch() {
        let state = TrackerState::fresh(true, &[device(0), device(1)], &UniqueIdIndex::new());
        assert!(!state.snapshot_matches(&[device(0)]));
        assert!(!state.snapshot_matches(&[device(1), device(0)]));
        assert!(!state.snapshot_matches(&[device(0), device(1), device(2)]));
    }

    #[test]
    fn test_grantable() {
        let mut status = GpuStatus::default();
        status.container_ids.push("a".into());
        assert!(status.is_grantable());
        status.accessibility = Accessibility::Exclusive;
        assert!(!status.is_grantable());
        status.container_ids.clear();
        assert!(status.is_grantable());
    }

    #[test]
    fn test_state_json_layout() {
        let mut state = TrackerState::fresh(true, &[device(0)], &UniqueIdIndex::new());
        state.gpus_status.get_mut(&0).unwrap().container_ids.push("c1".into());

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "enabled": true,
                "gpusStatus": {
                    "0": {
                        "uuid": "",
                        "partitionType": "",
                        "accessibility": 0,
                        "containerIds": ["c1"]
                    }
                },
                "gpusInfo": {
                    "0": {
                        "drmDevices": ["/dev/dri/card0", "/dev/dri/renderD128"],
                        "partitionType": ""
                    }
                }
            })
        );

        let decoded: TrackerState = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_unknown_accessibility_rejected() {
        let json = r#"{"uuid":"","partitionType":"","accessibility":7,"containerIds":[]}"#;
        assert!(serde_json::from_str::<GpuStatus>(json).is_err());
    }
}
