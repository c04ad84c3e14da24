use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use amd_container_toolkit::compat::docker::DEFAULT_DAEMON_CONFIG;
use amd_container_toolkit::compat::DEFAULT_ENGINE;
use amd_container_toolkit::gpu_tracker::Accessibility;

#[derive(Parser)]
#[command(name = "amd-ctk")]
#[command(about = "Tool to configure AMD Container Toolkit")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "AMD_CTK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the version
    Version,

    /// CDI spec commands
    Cdi {
        #[command(subcommand)]
        command: CdiCommands,
    },

    /// Container engine runtime configuration
    Runtime {
        #[command(subcommand)]
        command: RuntimeCommands,
    },

    /// GPU Tracker related commands
    #[command(name = "gpu-tracker")]
    GpuTracker(GpuTrackerArgs),
}

#[derive(Subcommand)]
pub enum CdiCommands {
    /// Generate the CDI spec for GPUs
    Generate {
        /// Full path of the output file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the spec instead of writing it
        #[arg(long)]
        stdout: bool,
    },

    /// List the CDI devices
    List,

    /// Check that the saved CDI spec matches the GPUs present
    Validate {
        /// Path of the CDI spec to check
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum RuntimeCommands {
    /// Configure the AMD runtime in the container engine
    Configure {
        /// Target runtime engine
        #[arg(long, default_value = DEFAULT_ENGINE)]
        runtime: String,

        /// Path to the configuration file of the target engine
        #[arg(long, default_value = DEFAULT_DAEMON_CONFIG)]
        config_path: PathBuf,

        /// Set the AMD runtime as the default
        #[arg(long, alias = "amd-set-as-default", conflicts_with_all = ["unset_as_default", "remove"])]
        set_as_default: bool,

        /// Stop using the AMD runtime as the default
        #[arg(long, conflicts_with = "remove")]
        unset_as_default: bool,

        /// Remove the AMD runtime from the engine configuration
        #[arg(long)]
        remove: bool,
    },
}

/// `amd-ctk gpu-tracker <gpu-ids> <exclusive|shared>` or a subcommand.
#[derive(Args)]
#[command(args_conflicts_with_subcommands = true, arg_required_else_help = true)]
pub struct GpuTrackerArgs {
    #[command(subcommand)]
    pub command: Option<GpuTrackerCommands>,

    /// GPU IDs: comma separated indices, ranges, unique IDs or `all`
    #[arg(requires = "accessibility")]
    pub gpu_ids: Option<String>,

    /// New accessibility of the selected GPUs
    #[arg(value_enum)]
    pub accessibility: Option<AccessMode>,
}

#[derive(Subcommand)]
pub enum GpuTrackerCommands {
    /// Initialize the GPU Tracker
    Init,
    /// Enable the GPU Tracker
    Enable,
    /// Disable the GPU Tracker
    Disable,
    /// Reset the GPU Tracker
    Reset,
    /// Show the GPU Tracker status
    Status,
    /// Release the GPUs used by a container
    #[command(hide = true)]
    Release {
        container_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AccessMode {
    Exclusive,
    Shared,
}

impl From<AccessMode> for Accessibility {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Exclusive => Accessibility::Exclusive,
            AccessMode::Shared => Accessibility::Shared,
        }
    }
}
