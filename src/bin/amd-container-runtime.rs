//! OCI runtime shim: prepares AMD GPU access, then hands over to runc.

use amd_container_toolkit::monitoring::init_logging;
use amd_container_toolkit::runtime::oci::{HELP_BANNER, RuntimeArgs};
use amd_container_toolkit::{Toolkit, ToolkitConfig};
use anyhow::{Context, Result};
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let config = ToolkitConfig::resolve(None).context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging, false)?;

    let args = RuntimeArgs::parse(std::env::args().skip(1));
    info!("Creating AMD container runtime with args {:?}", args.args);

    let toolkit = Toolkit::new(config);

    if let Err(err) = toolkit.cdi().generate_and_write() {
        warn!("⚠️ Failed to refresh CDI spec: {}", err);
    }

    if args.has_help {
        print!("{HELP_BANNER}");
    }

    if args.is_create {
        if let Err(err) = toolkit.spec_mutator().prepare_create(&args) {
            error!("Failed to add GPUs to OCI spec: {}", err);
            return Err(err).context("Failed to prepare container spec");
        }
    }

    let err = toolkit.executor().exec(&args.args);
    Err(err).context("Failed to call runc")
}
