mod common;

use amd_container_toolkit::error::TrackerError;
use amd_container_toolkit::gpu_tracker::{
    Accessibility, AccessibilityOutcome, EnableOutcome, GpuTracker, JsonFileStore, ReleaseOutcome,
    StateStore, TrackerState, TrackerStatus,
};
use common::{FixedDiscovery, gpus, state_path, tracker_config};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn enabled_tracker(dir: &TempDir, count: usize) -> (GpuTracker, Arc<FixedDiscovery>) {
    let discovery = Arc::new(FixedDiscovery::new(gpus(count)));
    let tracker = GpuTracker::new(&tracker_config(dir.path()), discovery.clone());
    assert_eq!(tracker.enable().unwrap(), EnableOutcome::Enabled);
    (tracker, discovery)
}

fn holders(tracker: &GpuTracker) -> Vec<(usize, Vec<String>)> {
    match tracker.status().unwrap() {
        TrackerStatus::Active(rows) => rows
            .into_iter()
            .map(|(gpu, status)| (gpu, status.container_ids))
            .collect(),
        other => panic!("tracker not active: {other:?}"),
    }
}

#[test]
fn test_lifecycle() {
    let dir = TempDir::new().unwrap();
    let tracker = GpuTracker::new(&tracker_config(dir.path()), Arc::new(FixedDiscovery::new(gpus(2))));

    assert!(!tracker.is_initialized().unwrap());
    assert_eq!(tracker.status().unwrap(), TrackerStatus::Disabled);
    assert!(tracker.is_initialized().unwrap());

    assert_eq!(tracker.enable().unwrap(), EnableOutcome::Enabled);
    assert_eq!(tracker.enable().unwrap(), EnableOutcome::AlreadyEnabled);
    match tracker.status().unwrap() {
        TrackerStatus::Active(rows) => {
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].1.uuid, "0xA0");
            assert!(rows.iter().all(|(_, s)| s.accessibility == Accessibility::Shared));
        }
        other => panic!("unexpected status {other:?}"),
    }

    tracker.disable().unwrap();
    assert_eq!(tracker.status().unwrap(), TrackerStatus::Disabled);
}

#[test]
fn test_exclusive_gpu_has_single_holder() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = enabled_tracker(&dir, 2);

    tracker.set_accessibility("0", Accessibility::Exclusive).unwrap();
    assert_eq!(tracker.reserve("0", "c1").unwrap(), vec![0]);

    match tracker.reserve("0-1", "c2") {
        Err(TrackerError::GpusUnavailable { gpus }) => assert_eq!(gpus, vec![0]),
        other => panic!("expected GPU 0 to be unavailable, got {other:?}"),
    }
    // All or nothing: GPU 1 was not granted either.
    assert_eq!(holders(&tracker), vec![(0, vec!["c1".to_string()]), (1, vec![])]);

    assert_eq!(
        tracker.release("c1").unwrap(),
        ReleaseOutcome::Released {
            container_id: "c1".into(),
            gpus: vec![0],
        }
    );
    assert_eq!(tracker.reserve("0-1", "c2").unwrap(), vec![0, 1]);
}

#[test]
fn test_exclusive_skips_gpus_with_two_holders() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = enabled_tracker(&dir, 3);

    tracker.reserve("0,1", "c1").unwrap();
    tracker.reserve("0", "c2").unwrap();

    match tracker.set_accessibility("all", Accessibility::Exclusive).unwrap() {
        AccessibilityOutcome::Applied { converted, skipped, .. } => {
            assert_eq!(converted, vec![1, 2]);
            assert_eq!(skipped, vec![0]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // Making a GPU shared is unconditional.
    match tracker.set_accessibility("0-2", Accessibility::Shared).unwrap() {
        AccessibilityOutcome::Applied { converted, skipped, .. } => {
            assert_eq!(converted, vec![0, 1, 2]);
            assert!(skipped.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_release_leaves_other_holders() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = enabled_tracker(&dir, 3);

    tracker.reserve("0,1", "container_1").unwrap();
    tracker.reserve("0-2", "container_2").unwrap();

    let outcome = tracker.release("container_1").unwrap();
    assert_eq!(outcome.to_string(), "Released GPUs [0, 1] used by container container_1\n");
    assert_eq!(
        holders(&tracker),
        vec![
            (0, vec!["container_2".to_string()]),
            (1, vec!["container_2".to_string()]),
            (2, vec!["container_2".to_string()]),
        ]
    );
}

#[test]
fn test_release_without_state_is_noop() {
    let dir = TempDir::new().unwrap();
    let tracker = GpuTracker::new(&tracker_config(dir.path()), Arc::new(FixedDiscovery::new(gpus(1))));
    assert_eq!(tracker.release("c1").unwrap(), ReleaseOutcome::NotInitialized);
    assert!(!state_path(dir.path()).exists());
}

#[test]
fn test_topology_drift_blocks_changes() {
    let dir = TempDir::new().unwrap();
    let (tracker, discovery) = enabled_tracker(&dir, 2);
    discovery.replace(gpus(3));

    assert_eq!(tracker.status().unwrap(), TrackerStatus::Inconsistent);
    assert_eq!(
        tracker.set_accessibility("0", Accessibility::Exclusive).unwrap(),
        AccessibilityOutcome::Inconsistent
    );
    assert!(matches!(tracker.reserve("0", "c1"), Err(TrackerError::ConsistencyMismatch)));

    let reset = tracker.reset().unwrap();
    assert!(reset.was_enabled);
    assert_eq!(holders(&tracker).len(), 3);
}

#[test]
fn test_reset_keeps_enabled_and_drops_reservations() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = enabled_tracker(&dir, 2);
    tracker.reserve("all", "c1").unwrap();

    assert!(tracker.reset().unwrap().was_enabled);
    assert_eq!(holders(&tracker), vec![(0, vec![]), (1, vec![])]);
}

#[test]
fn test_disabled_reserve_records_nothing() {
    let dir = TempDir::new().unwrap();
    let tracker = GpuTracker::new(&tracker_config(dir.path()), Arc::new(FixedDiscovery::new(gpus(2))));

    assert_eq!(tracker.reserve("1,0,9", "c1").unwrap(), vec![0, 1]);
    let state = JsonFileStore::new(state_path(dir.path())).load().unwrap();
    assert!(!state.enabled);
    assert!(state.gpus_status.values().all(|s| s.container_ids.is_empty()));
}

#[test]
fn test_state_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = enabled_tracker(&dir, 2);
    tracker.reserve("1", "c1").unwrap();

    let store = JsonFileStore::new(state_path(dir.path()));
    let state = store.load().unwrap();
    store.save(&state).unwrap();
    assert_eq!(store.load().unwrap(), state);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state_path(dir.path())).unwrap()).unwrap();
    assert_eq!(raw["enabled"], serde_json::json!(true));
    assert_eq!(raw["gpusStatus"]["1"]["containerIds"], serde_json::json!(["c1"]));
    assert_eq!(raw["gpusStatus"]["1"]["accessibility"], serde_json::json!(0));
}

/// Store that flags any load issued while another caller is between its
/// own load and save.
struct OverlapDetector {
    inner: JsonFileStore,
    busy: AtomicBool,
    overlaps: AtomicUsize,
}

impl StateStore for OverlapDetector {
    fn exists(&self) -> Result<bool, TrackerError> {
        self.inner.exists()
    }

    fn load(&self) -> Result<TrackerState, TrackerError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let state = self.inner.load();
        thread::sleep(Duration::from_millis(25));
        state
    }

    fn save(&self, state: &TrackerState) -> Result<(), TrackerError> {
        let result = self.inner.save(state);
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[test]
fn test_concurrent_reservations_are_serialized() {
    let dir = TempDir::new().unwrap();
    let (_, _) = enabled_tracker(&dir, 4);

    let store = Arc::new(OverlapDetector {
        inner: JsonFileStore::new(state_path(dir.path())),
        busy: AtomicBool::new(false),
        overlaps: AtomicUsize::new(0),
    });
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|gpu| {
            let config = tracker_config(dir.path());
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let tracker = GpuTracker::new(&config, Arc::new(FixedDiscovery::new(gpus(4)))).with_store(store);
                barrier.wait();
                tracker.reserve(&gpu.to_string(), &format!("c{gpu}")).unwrap()
            })
        })
        .collect();

    for (gpu, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), vec![gpu]);
    }
    assert_eq!(store.overlaps.load(Ordering::SeqCst), 0);

    let state = JsonFileStore::new(state_path(dir.path())).load().unwrap();
    for gpu in 0..4 {
        assert_eq!(state.gpus_status[&gpu].container_ids, vec![format!("c{gpu}")]);
    }
}
