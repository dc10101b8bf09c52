//! Worker side of a task
//!
//! Runs inside the process started by the executor. Whatever the function
//! does (return, fail, panic), the outcome ends up in the task store.

use crate::executor::{ENV_FUNCTION, ENV_STORE, ENV_TASK_ID};
use crate::function::{CallArguments, FunctionRegistry};
use fnjob_foundation::{Error, Outcome, Result, TaskStore, TaskStoreSettings};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info};

/// Everything a worker needs to run one task
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub task_id: String,
    pub function_name: String,
    pub store: TaskStoreSettings,
    /// Raw JSON object of validated arguments
    pub payload: String,
}

impl WorkerInvocation {
    /// Read the invocation written by the executor (environment + stdin)
    pub fn from_env() -> Result<Self> {
        let task_id = env_var(ENV_TASK_ID)?;
        let function_name = env_var(ENV_FUNCTION)?;
        let store = serde_json::from_str(&env_var(ENV_STORE)?)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", ENV_STORE, e)))?;

        let mut payload = String::new();
        std::io::stdin().read_to_string(&mut payload)?;

        Ok(Self {
            task_id,
            function_name,
            store,
            payload,
        })
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{} is not set", name)))
}

/// Run the invoked function and record its outcome.
///
/// Returns whether the outcome was written; `false` means the task was
/// already terminal (terminated or timed out meanwhile).
pub fn run_worker(registry: &FunctionRegistry, invocation: WorkerInvocation) -> Result<bool> {
    let store = TaskStore::open(&invocation.store)?;

    info!(
        "Worker started: task {} ({})",
        invocation.task_id, invocation.function_name
    );
    let outcome = execute(registry, &invocation);
    debug!("Task {} finished: {:?}", invocation.task_id, outcome);

    store.finish(&invocation.task_id, outcome)
}

fn execute(registry: &FunctionRegistry, invocation: &WorkerInvocation) -> Outcome {
    let Some(definition) = registry.lookup(&invocation.function_name) else {
        return Outcome::error(format!(
            "Function not found: {}",
            invocation.function_name
        ));
    };

    let arguments: CallArguments = match serde_json::from_str(&invocation.payload) {
        Ok(arguments) => arguments,
        Err(e) => return Outcome::error(format!("Invalid arguments: {}", e)),
    };

    match panic::catch_unwind(AssertUnwindSafe(|| definition.call(&arguments))) {
        Ok(Ok(value)) => Outcome::Value(value),
        Ok(Err(e)) => Outcome::error(e.to_string()),
        Err(panic) => Outcome::error(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{ArgSpec, ArgType, FunctionDefinition};
    use fnjob_foundation::TaskStatus;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("add", |args| Ok(args.integer("x")? + args.integer("y")?))
                    .arg(ArgSpec::required("x", ArgType::Integer, ""))
                    .arg(ArgSpec::required("y", ArgType::Integer, "")),
            )
            .unwrap();
        registry
            .register(FunctionDefinition::new("fail", |_| -> anyhow::Result<()> {
                anyhow::bail!("intentional failure")
            }))
            .unwrap();
        registry
            .register(FunctionDefinition::new("panic", |_| -> anyhow::Result<()> {
                panic!("worker blew up")
            }))
            .unwrap();
        registry
    }

    /// Admit `task_id` in a fresh on-disk store and build its invocation
    fn admitted_invocation(
        dir: &tempfile::TempDir,
        task_id: &str,
        function_name: &str,
        payload: &str,
    ) -> (TaskStore, WorkerInvocation) {
        let settings = TaskStoreSettings::new(dir.path().join("tasks.db"));
        let store = TaskStore::open_fresh(&settings).unwrap();
        store.admit_and_create(task_id, function_name, 0).unwrap();

        let invocation = WorkerInvocation {
            task_id: task_id.to_string(),
            function_name: function_name.to_string(),
            store: settings,
            payload: payload.to_string(),
        };
        (store, invocation)
    }

    #[test]
    fn test_value_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t1", "add", r#"{"x": 3, "y": 4}"#);

        assert!(run_worker(&registry(), invocation).unwrap());
        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.result, json!(7));
    }

    #[test]
    fn test_error_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t1", "fail", "{}");

        run_worker(&registry(), invocation).unwrap();
        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.result, json!("intentional failure"));
    }

    #[test]
    fn test_panic_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t1", "panic", "{}");

        run_worker(&registry(), invocation).unwrap();
        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.result, json!("worker blew up"));
    }

    #[test]
    fn test_unknown_function_and_bad_payload_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t1", "missing", "{}");
        run_worker(&registry(), invocation).unwrap();
        assert_eq!(
            store.get("t1").unwrap().unwrap().result,
            json!("Function not found: missing")
        );

        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t2", "add", "not json");
        run_worker(&registry(), invocation).unwrap();
        assert!(store.get("t2").unwrap().unwrap().is_failed());
    }

    #[test]
    fn test_terminated_task_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (store, invocation) = admitted_invocation(&dir, "t1", "add", r#"{"x": 1, "y": 1}"#);
        store.force_fail("t1", "Manual Termination").unwrap();

        assert!(!run_worker(&registry(), invocation).unwrap());
        assert_eq!(
            store.get("t1").unwrap().unwrap().result,
            json!("Manual Termination")
        );
    }
}
