//! Worker processes
//!
//! - `ProcessExecutor` - spawns, reaps and kills one process per task
//! - `EntryPoint` - how a worker process is started

pub mod entry;
pub mod local;

pub use entry::{EntryPoint, ENV_FUNCTION, ENV_STORE, ENV_TASK_ID, WORKER_SUBCOMMAND};
pub use local::ProcessExecutor;
