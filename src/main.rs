mod cli;

use amd_container_toolkit::compat::{self, AMD_RUNTIME_EXECUTABLE, AMD_RUNTIME_NAME};
use amd_container_toolkit::monitoring::init_logging;
use amd_container_toolkit::{Toolkit, ToolkitConfig};
use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{CdiCommands, Cli, Commands, GpuTrackerArgs, GpuTrackerCommands, RuntimeCommands};
use tracing::{debug, info};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ToolkitConfig::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging, cli.verbose)?;
    debug!("Running amd-ctk with config {:?}", config);

    let toolkit = Toolkit::new(config);

    match cli.command {
        Commands::Version => {
            println!(
                "Version: {}\nBuild Date: {}\nGitCommit: {}",
                env!("CARGO_PKG_VERSION"),
                option_env!("AMD_CTK_BUILD_DATE").unwrap_or("unknown"),
                option_env!("AMD_CTK_GIT_COMMIT").unwrap_or("none"),
            );
        }

        Commands::Cdi { command } => run_cdi(&toolkit, command)?,

        Commands::Runtime { command } => run_runtime(command)?,

        Commands::GpuTracker(args) => run_gpu_tracker(&toolkit, args)?,
    }

    Ok(())
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("Permission denied: Not running as root");
    }
    Ok(())
}

fn run_cdi(toolkit: &Toolkit, command: CdiCommands) -> Result<()> {
    match command {
        CdiCommands::Generate { output, stdout } => {
            let mut generator = toolkit.cdi();
            if stdout {
                let spec = generator.generate()?;
                println!("{}", spec.to_pretty_json()?);
                return Ok(());
            }

            require_root()?;
            if let Some(output) = output {
                let output = std::path::absolute(&output)
                    .with_context(|| format!("Incorrect output file {:?}", output))?;
                generator = generator.with_spec_path(output);
            }
            let spec = generator.generate_and_write()?;
            println!(
                "Generated CDI spec with {} GPU device(s) at {}",
                spec.devices.len().saturating_sub(1),
                generator.spec_path().display()
            );
        }

        CdiCommands::List => {
            print!("{}", toolkit.cdi().list()?);
        }

        CdiCommands::Validate { path } => {
            let mut generator = toolkit.cdi();
            if let Some(path) = path {
                generator = generator.with_spec_path(path);
            }
            if generator.validate()? {
                println!("CDI spec {} is valid", generator.spec_path().display());
            } else {
                println!(
                    "CDI spec {} is not valid, please regenerate it with 'amd-ctk cdi generate'",
                    generator.spec_path().display()
                );
            }
        }
    }
    Ok(())
}

fn run_runtime(command: RuntimeCommands) -> Result<()> {
    match command {
        RuntimeCommands::Configure {
            runtime,
            config_path,
            set_as_default,
            unset_as_default,
            remove,
        } => {
            require_root()?;
            let mut engine = compat::load_engine_config(&runtime, &config_path)
                .with_context(|| format!("Failed to init config for runtime engine {}", runtime))?;

            if remove {
                engine.remove_runtime(AMD_RUNTIME_NAME)?;
            } else if unset_as_default {
                engine.unset_default_runtime()?;
                println!("Removed {} as the default runtime", AMD_RUNTIME_NAME);
            } else {
                engine.configure_runtime(AMD_RUNTIME_NAME, AMD_RUNTIME_EXECUTABLE, set_as_default)?;
            }

            let written = engine.save(&config_path).context("Failed to save the config")?;
            if written > 0 {
                println!("Updated the config file: {}", config_path.display());
            }
            println!("Please restart {} daemon", runtime);
            info!("✅ Runtime configuration for {} updated", runtime);
        }
    }
    Ok(())
}

fn run_gpu_tracker(toolkit: &Toolkit, args: GpuTrackerArgs) -> Result<()> {
    require_root()?;
    let tracker = toolkit.tracker();

    match (args.command, args.gpu_ids, args.accessibility) {
        (Some(GpuTrackerCommands::Init), _, _) => {
            tracker.initialize()?;
            println!("GPU Tracker has been initialized");
        }
        (Some(GpuTrackerCommands::Enable), _, _) => print!("{}", tracker.enable()?),
        (Some(GpuTrackerCommands::Disable), _, _) => {
            tracker.disable()?;
            println!("GPU Tracker has been disabled");
        }
        (Some(GpuTrackerCommands::Reset), _, _) => print!("{}", tracker.reset()?),
        (Some(GpuTrackerCommands::Status), _, _) => print!("{}", tracker.status()?),
        (Some(GpuTrackerCommands::Release { container_id }), _, _) => {
            print!("{}", tracker.release(&container_id)?);
        }
        (None, Some(gpu_ids), Some(mode)) => {
            print!("{}", tracker.set_accessibility(&gpu_ids, mode.into())?);
        }
        (None, _, _) => bail!("Missing arguments. Usage: gpu-tracker <gpu_ids> <exclusive|shared>"),
    }
    Ok(())
}
