//! OCI runtime shim support.
//!
//! `amd-container-runtime` sits in front of runc. On `create` it reserves the
//! GPUs named by the container's visible-devices variable, injects their
//! device nodes into the bundle's `config.json` and registers a poststop hook
//! that hands the reservation back.

pub mod cdi;
#[cfg(feature = "oci-runtime")]
pub mod executor;
#[cfg(feature = "oci-runtime")]
mod spec;

use std::path::PathBuf;

#[cfg(feature = "oci-runtime")]
pub use executor::RuntimeExecutor;
#[cfg(feature = "oci-runtime")]
pub use spec::{SpecMutator, visible_devices};

pub const HELP_BANNER: &str =
    "\nAMD Container Runtime is a wrapper over runc. Below is the help for runc.\n\n";

/// What the shim needs to know about a runc command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeArgs {
    /// Arguments as received, without the program name.
    pub args: Vec<String>,
    pub bundle: Option<PathBuf>,
    pub is_create: bool,
    pub has_help: bool,
}

fn is_bundle_flag(flag: &str) -> bool {
    matches!(flag, "-b" | "-bundle" | "--b" | "--bundle")
}

fn is_help_flag(flag: &str) -> bool {
    matches!(flag, "-h" | "-help" | "--h" | "--help")
}

impl RuntimeArgs {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut parsed = RuntimeArgs::default();

        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            let (flag, value) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (arg, None),
            };

            if is_bundle_flag(flag) {
                match value {
                    Some(path) => parsed.bundle = Some(PathBuf::from(path)),
                    None => {
                        if let Some(path) = args.get(i + 1) {
                            parsed.bundle = Some(PathBuf::from(path));
                            i += 1;
                        }
                    }
                }
            } else if is_help_flag(arg) {
                parsed.has_help = true;
            } else if arg == "create" {
                parsed.is_create = true;
            }
            i += 1;
        }

        parsed.args = args;
        parsed
    }

    /// The container ID of a `create` invocation: its final argument.
    pub fn container_id(&self) -> Option<&str> {
        if !self.is_create {
            return None;
        }
        self.args
            .last()
            .map(String::as_str)
            .filter(|id| !id.starts_with('-') && *id != "create")
    }
}
