//! Cross-process GPU reservation tracking.
//!
//! Every operation runs under an exclusive file lock, reads the persisted
//! state, and writes it back atomically. Reservations are only honoured while
//! the stored topology snapshot matches what discovery reports now; after a
//! driver reload or repartition the state must be reset.

pub mod lock;
pub mod report;
pub mod selector;
pub mod state;
pub mod store;

pub use lock::{Clock, FileLock, LockSettings, SystemClock};
pub use report::{AccessibilityOutcome, EnableOutcome, ReleaseOutcome, ResetOutcome, TrackerStatus};
pub use selector::{GpuSelection, resolve};
pub use state::{Accessibility, GpuStatus, TrackerState};
pub use store::{JsonFileStore, StateStore};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::runtime::gpu::{DeviceInfo, GpuDiscovery, UniqueIdIndex};
use report::GpuList;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Span, debug, error, info, info_span, warn};

/// A GPU can only become exclusive while fewer than this many containers hold it.
const EXCLUSIVE_HOLDER_LIMIT: usize = 2;

pub struct GpuTracker {
    discovery: Arc<dyn GpuDiscovery>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    lock_path: PathBuf,
    lock_settings: LockSettings,
    span: Span,
}

impl GpuTracker {
    pub fn new(config: &TrackerConfig, discovery: Arc<dyn GpuDiscovery>) -> Self {
        let span = info_span!("gpu_tracker", state = %config.state_file.display());
        Self {
            discovery,
            store: Arc::new(JsonFileStore::new(&config.state_file)),
            clock: Arc::new(SystemClock),
            lock_path: config.lock_file.clone(),
            lock_settings: LockSettings {
                timeout: config.lock_timeout(),
                poll_interval: config.lock_poll_interval(),
            },
            span,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `operation` under the tracker lock. A panic inside becomes
    /// [`TrackerError::Panicked`]; the lock is released either way.
    fn with_lock<T>(
        &self,
        name: &'static str,
        operation: impl FnOnce() -> Result<T, TrackerError>,
    ) -> Result<T, TrackerError> {
        let _entered = self.span.enter();
        let lock = FileLock::acquire(&self.lock_path, &self.lock_settings, self.clock.as_ref())?;
        debug!(operation = name, "running under tracker lock");

        let result = panic::catch_unwind(AssertUnwindSafe(operation)).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!(operation = name, %message, "tracker operation panicked");
            Err(TrackerError::Panicked {
                operation: name,
                message,
            })
        });

        drop(lock);
        result
    }

    fn fresh_state(&self, enabled: bool) -> Result<TrackerState, TrackerError> {
        let devices = self.discovery.discover()?;
        let unique_ids = self.unique_ids();
        Ok(TrackerState::fresh(enabled, &devices, &unique_ids))
    }

    /// Missing unique IDs only cost the ability to select by ID.
    fn unique_ids(&self) -> UniqueIdIndex {
        self.discovery.unique_id_index().unwrap_or_else(|err| {
            warn!("⚠️ Unique IDs unavailable: {}", err);
            UniqueIdIndex::new()
        })
    }

    fn ensure_initialized(&self) -> Result<(), TrackerError> {
        if !self.store.exists()? {
            info!("📝 Creating GPU tracker state");
            self.store.save(&self.fresh_state(false)?)?;
        }
        Ok(())
    }

    /// Discover the host and compare against the stored snapshot.
    fn check_snapshot(&self, state: &TrackerState) -> Result<Option<Vec<DeviceInfo>>, TrackerError> {
        let devices = self.discovery.discover()?;
        if state.snapshot_matches(&devices) {
            Ok(Some(devices))
        } else {
            warn!("⚠️ GPUs info is invalid. Please reset GPU Tracker.");
            Ok(None)
        }
    }

    fn log_invalid(selection: &GpuSelection) {
        if !selection.invalid_ranges.is_empty() {
            warn!(
                "Ignoring {} GPUs Ranges as they are invalid",
                GpuList(&selection.invalid_ranges)
            );
        }
        if !selection.invalid.is_empty() {
            warn!("Ignoring {} GPUs as they are invalid", GpuList(&selection.invalid));
        }
    }

    /// Write a disabled, unreserved state built from current discovery.
    pub fn initialize(&self) -> Result<(), TrackerError> {
        self.with_lock("initialize", || {
            self.store.save(&self.fresh_state(false)?)?;
            info!("✅ GPU tracker initialized");
            Ok(())
        })
    }

    pub fn is_initialized(&self) -> Result<bool, TrackerError> {
        self.store.exists()
    }

    /// Enabling rebuilds the state, dropping every reservation.
    pub fn enable(&self) -> Result<EnableOutcome, TrackerError> {
        self.with_lock("enable", || {
            self.ensure_initialized()?;
            if self.store.load()?.enabled {
                return Ok(EnableOutcome::AlreadyEnabled);
            }
            self.store.save(&self.fresh_state(true)?)?;
            info!("✅ GPU tracker enabled");
            Ok(EnableOutcome::Enabled)
        })
    }

    pub fn disable(&self) -> Result<(), TrackerError> {
        self.with_lock("disable", || {
            let state = if self.store.exists()? {
                let mut state = self.store.load()?;
                state.enabled = false;
                state
            } else {
                self.fresh_state(false)?
            };
            self.store.save(&state)?;
            info!("🛑 GPU tracker disabled");
            Ok(())
        })
    }

    /// Rebuild from current discovery, keeping only the enabled flag.
    pub fn reset(&self) -> Result<ResetOutcome, TrackerError> {
        self.with_lock("reset", || {
            let was_enabled = self.store.exists()? && self.store.load()?.enabled;
            self.store.save(&self.fresh_state(was_enabled)?)?;
            info!("🔄 GPU tracker reset");
            Ok(ResetOutcome { was_enabled })
        })
    }

    pub fn status(&self) -> Result<TrackerStatus, TrackerError> {
        self.with_lock("status", || {
            self.ensure_initialized()?;
            let state = self.store.load()?;
            if !state.enabled {
                return Ok(TrackerStatus::Disabled);
            }
            if self.check_snapshot(&state)?.is_none() {
                return Ok(TrackerStatus::Inconsistent);
            }
            Ok(TrackerStatus::Active(state.gpus_status.into_iter().collect()))
        })
    }

    /// Mark the selected GPUs shared or exclusive. A GPU held by two or more
    /// containers is not made exclusive.
    pub fn set_accessibility(
        &self,
        spec: &str,
        mode: Accessibility,
    ) -> Result<AccessibilityOutcome, TrackerError> {
        self.with_lock("set_accessibility", || {
            self.ensure_initialized()?;
            let mut state = self.store.load()?;
            if !state.enabled {
                return Ok(AccessibilityOutcome::Disabled);
            }
            let Some(devices) = self.check_snapshot(&state)? else {
                return Ok(AccessibilityOutcome::Inconsistent);
            };

            let selection = resolve(spec, &devices, &self.unique_ids());
            Self::log_invalid(&selection);

            let mut converted = Vec::new();
            let mut skipped = Vec::new();
            for gpu in &selection.valid {
                let Some(status) = state.gpus_status.get_mut(gpu) else {
                    warn!("GPU {} missing from tracker state", gpu);
                    continue;
                };
                if mode == Accessibility::Exclusive
                    && status.container_ids.len() >= EXCLUSIVE_HOLDER_LIMIT
                {
                    skipped.push(*gpu);
                    continue;
                }
                status.accessibility = mode;
                converted.push(*gpu);
            }

            self.store.save(&state)?;
            info!("GPUs {} set to {}", GpuList(&converted), mode);
            Ok(AccessibilityOutcome::Applied {
                mode,
                converted,
                skipped,
                selection,
            })
        })
    }

    /// Record `container_id` as a holder of every selected GPU.
    ///
    /// All or nothing: if any selected GPU is exclusive and already held,
    /// nothing is recorded and [`TrackerError::GpusUnavailable`] names those
    /// GPUs. While tracking is disabled the selection is returned unrecorded.
    pub fn reserve(&self, spec: &str, container_id: &str) -> Result<Vec<usize>, TrackerError> {
        self.with_lock("reserve", || {
            self.ensure_initialized()?;
            let mut state = self.store.load()?;
            let devices = self.discovery.discover()?;

            let selection = resolve(spec, &devices, &self.unique_ids());
            Self::log_invalid(&selection);

            if !state.enabled {
                return Ok(selection.valid);
            }
            if !state.snapshot_matches(&devices) {
                return Err(TrackerError::ConsistencyMismatch);
            }

            let mut unavailable = Vec::new();
            for gpu in &selection.valid {
                match state.gpus_status.get_mut(gpu) {
                    Some(status) if status.is_grantable() => {
                        status.container_ids.push(container_id.to_string());
                    }
                    _ => unavailable.push(*gpu),
                }
            }

            if !unavailable.is_empty() {
                warn!(
                    "GPUs {} are exclusive and already in use",
                    GpuList(&unavailable)
                );
                return Err(TrackerError::GpusUnavailable { gpus: unavailable });
            }

            self.store.save(&state)?;
            info!("GPUs {} allocated to {}", GpuList(&selection.valid), container_id);
            Ok(selection.valid)
        })
    }

    /// Drop `container_id` from every GPU it holds.
    pub fn release(&self, container_id: &str) -> Result<ReleaseOutcome, TrackerError> {
        self.with_lock("release", || {
            if !self.store.exists()? {
                debug!("No tracker state, nothing to release");
                return Ok(ReleaseOutcome::NotInitialized);
            }

            let mut state = self.store.load()?;
            let mut gpus = Vec::new();
            for (gpu, status) in state.gpus_status.iter_mut() {
                let before = status.container_ids.len();
                status.container_ids.retain(|id| id != container_id);
                if status.container_ids.len() != before {
                    gpus.push(*gpu);
                }
            }

            self.store.save(&state)?;
            if !gpus.is_empty() {
                info!("Released GPUs {} used by container {}", GpuList(&gpus), container_id);
            }
            Ok(ReleaseOutcome::Released {
                container_id: container_id.to_string(),
                gpus,
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
