use super::RuntimeArgs;
use crate::config::RuntimeConfig;
use crate::error::OciError;
use crate::gpu_tracker::GpuTracker;
use crate::gpu_tracker::report::GpuList;
use crate::runtime::gpu::{DeviceAttributeReader, DeviceAttributes, GpuDiscovery, device};
use oci_spec::runtime::{
    HookBuilder, LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder,
    LinuxDeviceType, Spec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Span, debug, info, info_span, warn};

const SPEC_FILE: &str = "config.json";

/// Value of `name` in the container process environment. The last
/// definition wins; an empty value counts as unset.
pub fn visible_devices(spec: &Spec, name: &str) -> Option<String> {
    let env = spec.process().as_ref()?.env().as_ref()?;
    env.iter()
        .filter_map(|entry| entry.split_once('='))
        .filter(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .last()
        .filter(|value| !value.is_empty())
}

fn device_type(attrs: &DeviceAttributes) -> LinuxDeviceType {
    match attrs.dev_type.as_str() {
        "b" => LinuxDeviceType::B,
        "u" => LinuxDeviceType::U,
        "p" => LinuxDeviceType::P,
        _ => LinuxDeviceType::C,
    }
}

fn linux_device(attrs: &DeviceAttributes) -> Result<LinuxDevice, OciError> {
    LinuxDeviceBuilder::default()
        .path(PathBuf::from(&attrs.path))
        .typ(device_type(attrs))
        .major(attrs.major)
        .minor(attrs.minor)
        .file_mode(attrs.file_mode)
        .uid(attrs.uid)
        .gid(attrs.gid)
        .build()
        .map_err(|e| OciError::Build {
            what: format!("device {}", attrs.path),
            message: e.to_string(),
        })
}

fn cgroup_rule(attrs: &DeviceAttributes) -> Result<LinuxDeviceCgroup, OciError> {
    LinuxDeviceCgroupBuilder::default()
        .allow(attrs.allow)
        .typ(device_type(attrs))
        .major(attrs.major)
        .minor(attrs.minor)
        .access(attrs.access.clone())
        .build()
        .map_err(|e| OciError::Build {
            what: format!("device cgroup rule for {}", attrs.path),
            message: e.to_string(),
        })
}

/// Rewrites a bundle's runtime spec for the GPUs a container is granted.
pub struct SpecMutator {
    tracker: GpuTracker,
    discovery: Arc<dyn GpuDiscovery>,
    reader: Arc<dyn DeviceAttributeReader>,
    config: RuntimeConfig,
    span: Span,
}

impl SpecMutator {
    pub fn new(
        tracker: GpuTracker,
        discovery: Arc<dyn GpuDiscovery>,
        reader: Arc<dyn DeviceAttributeReader>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            tracker,
            discovery,
            reader,
            config: config.clone(),
            span: info_span!("oci"),
        }
    }

    /// Reserve and inject the requested GPUs for a `create` call.
    ///
    /// Returns the GPU indices added to the spec. Nothing is written when
    /// the container requests no GPUs. If the spec cannot be updated after
    /// a successful reservation, the reservation is released again.
    pub fn prepare_create(&self, args: &RuntimeArgs) -> Result<Vec<usize>, OciError> {
        let _entered = self.span.enter();
        let bundle = args.bundle.as_deref().ok_or(OciError::MissingBundle)?;
        let container_id = args.container_id().ok_or(OciError::MissingContainerId)?;

        let spec_path = bundle.join(SPEC_FILE);
        let mut spec = Spec::load(&spec_path).map_err(|source| OciError::Spec {
            action: "load",
            path: spec_path.clone(),
            source,
        })?;

        let Some(requested) = visible_devices(&spec, &self.config.visible_devices_env) else {
            debug!("{} not set for {}", self.config.visible_devices_env, container_id);
            return Ok(Vec::new());
        };

        let mut gpus = self.tracker.reserve(&requested, container_id)?;
        gpus.sort_unstable();
        gpus.dedup();
        if gpus.is_empty() {
            info!("No GPUs to be added to OCI spec");
            return Ok(gpus);
        }

        let updated = self
            .inject_devices(&mut spec, &gpus)
            .and_then(|()| self.add_release_hook(&mut spec, container_id))
            .and_then(|()| save_spec(&spec, &spec_path));

        if let Err(err) = updated {
            warn!("⚠️ Rolling back GPU reservation for {}: {}", container_id, err);
            if let Err(release_err) = self.tracker.release(container_id) {
                warn!("Failed to release GPUs held by {}: {}", container_id, release_err);
            }
            return Err(err);
        }

        info!("🎮 Added GPUs {} to container {}", GpuList(&gpus), container_id);
        Ok(gpus)
    }

    /// Device nodes and cgroup rules for `gpus` plus the KFD node.
    fn inject_devices(&self, spec: &mut Spec, gpus: &[usize]) -> Result<(), OciError> {
        let devices = self.discovery.discover()?;

        let mut paths: Vec<&str> = Vec::new();
        for gpu in gpus {
            match devices.get(*gpu) {
                Some(info) => paths.extend(info.drm_devices.iter().map(String::as_str)),
                None => warn!("GPU {} disappeared before it could be added", gpu),
            }
        }
        if paths.is_empty() {
            return Ok(());
        }
        paths.push(&self.config.kfd_device);

        let mut linux = spec.linux().clone().unwrap_or_default();
        let mut nodes = linux.devices().clone().unwrap_or_default();
        let mut resources = linux.resources().clone().unwrap_or_default();
        let mut rules = resources.devices().clone().unwrap_or_default();

        for attrs in device::read_all(self.reader.as_ref(), &paths) {
            nodes.push(linux_device(&attrs)?);
            rules.push(cgroup_rule(&attrs)?);
            debug!("Added GPU device {} to OCI spec", attrs.path);
        }

        resources.set_devices(Some(rules));
        linux.set_devices(Some(nodes)).set_resources(Some(resources));
        spec.set_linux(Some(linux));
        Ok(())
    }

    /// Poststop hook running `<hook> gpu-tracker release <container id>`.
    fn add_release_hook(&self, spec: &mut Spec, container_id: &str) -> Result<(), OciError> {
        let args = vec![
            self.config.hook_path.clone(),
            "gpu-tracker".to_string(),
            "release".to_string(),
            container_id.to_string(),
        ];

        let mut hooks = spec.hooks().clone().unwrap_or_default();
        let mut poststop = hooks.poststop().clone().unwrap_or_default();
        if poststop.iter().any(|hook| hook.args().as_ref() == Some(&args)) {
            return Ok(());
        }

        let hook = HookBuilder::default()
            .path(PathBuf::from(&self.config.hook_path))
            .args(args)
            .build()
            .map_err(|e| OciError::Build {
                what: "poststop hook".to_string(),
                message: e.to_string(),
            })?;
        poststop.push(hook);
        hooks.set_poststop(Some(poststop));
        spec.set_hooks(Some(hooks));

        debug!("Added OCI release hook {}", self.config.hook_path);
        Ok(())
    }
}

fn save_spec(spec: &Spec, path: &Path) -> Result<(), OciError> {
    spec.save(path).map_err(|source| OciError::Spec {
        action: "write",
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote spec to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_type_mapping() {
        let mut attrs = DeviceAttributes::unreadable("/dev/kfd");
        assert_eq!(device_type(&attrs), LinuxDeviceType::C);
        attrs.dev_type = "b".into();
        assert_eq!(device_type(&attrs), LinuxDeviceType::B);
    }
}
