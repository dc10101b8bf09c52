//! # fnjob-task
//!
//! Turns registered Rust functions into background jobs.
//!
//! ## Features
//!
//! - Function registry with declared argument schemas
//! - Argument coercion from loosely-typed JSON
//! - One OS process per task, started by re-entering the binary as a worker
//! - Concurrency admission through the shared task store
//! - Manual termination, timeout reaping, join/terminate shutdown

pub mod dispatcher;
pub mod executor;
pub mod function;
pub mod task;
pub mod validate;
pub mod worker;

pub use dispatcher::{JobDispatcher, MANUAL_TERMINATION, SERVER_SHUTDOWN};
pub use executor::{EntryPoint, ProcessExecutor, WORKER_SUBCOMMAND};
pub use function::{ArgSpec, ArgType, CallArguments, FunctionDefinition, FunctionRegistry};
pub use task::{LaunchResult, Rejection};
pub use validate::{build_call_arguments, validate, ArgumentError};
pub use worker::{run_worker, WorkerInvocation};
