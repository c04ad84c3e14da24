use super::state::TrackerState;
use crate::error::TrackerError;
use std::fs::{self, File, Permissions};
use std::io::{BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Persistence for [`TrackerState`]. Callers hold the tracker lock.
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    fn exists(&self) -> Result<bool, TrackerError>;

    fn load(&self) -> Result<TrackerState, TrackerError>;

    /// Replace the stored state. Readers see either the old or the new
    /// document, never a partial one.
    fn save(&self, state: &TrackerState) -> Result<(), TrackerError>;
}

/// JSON document on disk, replaced through a temporary file in the same
/// directory and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, action: &'static str) -> impl FnOnce(std::io::Error) -> TrackerError + '_ {
        move |source| TrackerError::FileIo {
            action,
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for JsonFileStore {
    fn exists(&self) -> Result<bool, TrackerError> {
        self.path.try_exists().map_err(self.io_error("stat"))
    }

    fn load(&self) -> Result<TrackerState, TrackerError> {
        let file = File::open(&self.path).map_err(self.io_error("open"))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| TrackerError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, state: &TrackerState) -> Result<(), TrackerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(self.io_error("create directory for"))?;

        let content = serde_json::to_vec(state)
            .map_err(std::io::Error::from)
            .map_err(self.io_error("encode"))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(self.io_error("create temporary file for"))?;
        tmp.write_all(&content).map_err(self.io_error("write"))?;
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .map_err(self.io_error("set permissions on"))?;
        tmp.as_file().sync_all().map_err(self.io_error("sync"))?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .map_err(self.io_error("replace"))?;

        debug!("Saved tracker state to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_tracker::state::Accessibility;
    use crate::runtime::gpu::{DeviceInfo, UniqueIdIndex};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_state() -> TrackerState {
        let devices = vec![DeviceInfo {
            drm_devices: vec!["/dev/dri/card0".into(), "/dev/dri/renderD128".into()],
            partition_type: String::new(),
        }];
        let mut state = TrackerState::fresh(true, &devices, &UniqueIdIndex::new());
        let status = state.gpus_status.get_mut(&0).unwrap();
        status.accessibility = Accessibility::Exclusive;
        status.container_ids.push("c1".into());
        state
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("gpu-tracker.json"));
        assert!(!store.exists().unwrap());

        let state = sample_state();
        store.save(&state).unwrap();
        assert!(store.exists().unwrap());
        assert_eq!(store.load().unwrap(), state);

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_save_leaves_no_temporary_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("gpu-tracker.json"));
        store.save(&sample_state()).unwrap();
        store.save(&TrackerState::default()).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.load().unwrap(), TrackerState::default());
    }

    #[test]
    fn test_corrupt_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gpu-tracker.json");
        fs::write(&path, "{\"enabled\": tru").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(TrackerError::Decode { .. })));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("missing.json"));
        assert!(matches!(
            store.load(),
            Err(TrackerError::FileIo { action: "open", .. })
        ));
    }
}
