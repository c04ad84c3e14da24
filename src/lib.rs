//! AMD Container Toolkit - GPU discovery, reservation tracking and container
//! runtime integration for AMD GPUs.
//!
//! The crate backs two binaries: `amd-ctk`, the administrative CLI, and
//! `amd-container-runtime`, a shim placed in front of runc that injects
//! reserved GPUs into container specs.

pub mod compat;
pub mod config;
pub mod error;
pub mod gpu_tracker;
pub mod monitoring;
pub mod runtime;

pub use config::ToolkitConfig;
pub use error::{Result, ToolkitError};
pub use gpu_tracker::GpuTracker;

use runtime::gpu::{DeviceAttributeReader, GpuDiscovery, SysDeviceReader, SysfsDiscovery};
use runtime::oci::cdi::CdiGenerator;
use std::sync::Arc;

/// Wires the toolkit components together from one configuration.
#[derive(Clone)]
pub struct Toolkit {
    config: ToolkitConfig,
    discovery: Arc<dyn GpuDiscovery>,
    reader: Arc<dyn DeviceAttributeReader>,
}

impl Toolkit {
    /// Components reading the host below `config.sysfs_root`.
    pub fn new(config: ToolkitConfig) -> Self {
        let discovery = Arc::new(SysfsDiscovery::new(&config.sysfs_root));
        let reader = Arc::new(SysDeviceReader::new(&config.sysfs_root));
        Self::with_components(config, discovery, reader)
    }

    /// Use the given discovery and attribute reader instead of sysfs.
    pub fn with_components(
        config: ToolkitConfig,
        discovery: Arc<dyn GpuDiscovery>,
        reader: Arc<dyn DeviceAttributeReader>,
    ) -> Self {
        Self {
            config,
            discovery,
            reader,
        }
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn discovery(&self) -> Arc<dyn GpuDiscovery> {
        Arc::clone(&self.discovery)
    }

    pub fn tracker(&self) -> GpuTracker {
        GpuTracker::new(&self.config.tracker, self.discovery())
    }

    pub fn cdi(&self) -> CdiGenerator {
        CdiGenerator::new(
            &self.config.cdi,
            &self.config.runtime.kfd_device,
            self.discovery(),
            Arc::clone(&self.reader),
        )
    }

    #[cfg(feature = "oci-runtime")]
    pub fn spec_mutator(&self) -> runtime::oci::SpecMutator {
        runtime::oci::SpecMutator::new(
            self.tracker(),
            self.discovery(),
            Arc::clone(&self.reader),
            &self.config.runtime,
        )
    }

    #[cfg(feature = "oci-runtime")]
    pub fn executor(&self) -> runtime::oci::RuntimeExecutor {
        runtime::oci::RuntimeExecutor::new(&self.config.runtime)
    }
}
