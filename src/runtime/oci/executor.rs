use crate::config::RuntimeConfig;
use crate::error::OciError;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use tracing::{error, info};

/// Replaces the current process with runc.
#[derive(Debug, Clone)]
pub struct RuntimeExecutor {
    runc_path: String,
}

impl RuntimeExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            runc_path: config.runc_path.clone(),
        }
    }

    pub fn runc_path(&self) -> &str {
        &self.runc_path
    }

    /// Exec runc with `args` and the inherited environment. A bare program
    /// name is looked up in `PATH`. Only returns if the exec failed.
    pub fn exec(&self, args: &[String]) -> OciError {
        info!("🚀 Running {} with args {:?}", self.runc_path, args);
        let source = Command::new(&self.runc_path).args(args).exec();
        error!("Failed to call {}: {}", self.runc_path, source);
        OciError::Io {
            action: "exec",
            path: PathBuf::from(&self.runc_path),
            source,
        }
    }
}
