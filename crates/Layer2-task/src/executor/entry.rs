//! Worker entry point

use fnjob_foundation::{Error, Result};
use std::path::PathBuf;

/// Environment variable carrying the task id
pub const ENV_TASK_ID: &str = "FNJOB_TASK_ID";

/// Environment variable carrying the function name
pub const ENV_FUNCTION: &str = "FNJOB_FUNCTION";

/// Environment variable carrying the task store settings as JSON
pub const ENV_STORE: &str = "FNJOB_STORE";

/// Subcommand that turns the binary into a worker
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Program and leading arguments that start a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-enter the running executable through its worker subcommand
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Config(format!("Cannot locate the current executable: {}", e)))?;
        Ok(Self::new(program).arg(WORKER_SUBCOMMAND))
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
