//! Job Dispatcher - launch, query, terminate and reap tasks
//!
//! ## Task lifecycle
//!
//! ```text
//! launch ─► validate ─► admit ─► spawn worker ─► Running
//!              │           │                        │
//!              ▼           ▼                        ├─► Done / Failed   (worker)
//!          rejected    rejected                     ├─► Failed          (terminate, shutdown)
//!                                                   └─► Timeout         (reaper)
//! ```
//!
//! The task store is the only shared state between the dispatcher and the
//! workers. Store calls block on SQLite, so they run on the blocking pool.
//!
//! A launch holds the launch gate (shared) from its `accepting` check until
//! its worker is tracked. Termination and shutdown take the gate
//! exclusively, so they never observe a Running record whose worker is not
//! tracked yet.

use crate::executor::{EntryPoint, ProcessExecutor};
use crate::function::FunctionRegistry;
use crate::task::{LaunchResult, Rejection};
use crate::validate::build_call_arguments;
use chrono::Utc;
use fnjob_foundation::{
    Admission, Error, Result, ShutdownMode, TaskRecord, TaskStore, TaskStoreSettings,
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result payload of a manually terminated task
pub const MANUAL_TERMINATION: &str = "Manual Termination";

/// Result payload of a task still running at shutdown
pub const SERVER_SHUTDOWN: &str = "Server Shutdown";

/// Orchestrates registry, store and executor
pub struct JobDispatcher {
    registry: Arc<FunctionRegistry>,
    store: Arc<TaskStore>,
    executor: Arc<ProcessExecutor>,
    entry_point: EntryPoint,
    accepting: AtomicBool,
    launch_gate: RwLock<()>,
}

impl JobDispatcher {
    pub fn new(
        registry: FunctionRegistry,
        store: TaskStore,
        executor: ProcessExecutor,
        entry_point: EntryPoint,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
            executor: Arc::new(executor),
            entry_point,
            accepting: AtomicBool::new(true),
            launch_gate: RwLock::new(()),
        }
    }

    /// Start from an empty store at `settings` with workers started by `entry_point`
    pub fn open(
        registry: FunctionRegistry,
        settings: &TaskStoreSettings,
        entry_point: EntryPoint,
    ) -> Result<Self> {
        let store = TaskStore::open_fresh(settings)?;
        let executor = ProcessExecutor::new(settings.clone());
        Ok(Self::new(registry, store, executor, entry_point))
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run a store operation on the blocking pool
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&TaskStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| Error::Internal(format!("Store operation failed: {}", e)))?
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Validate, admit and start one task.
    ///
    /// Refusals (unknown function, bad arguments, no headroom, shutting
    /// down) are a `LaunchResult`, not an error. An error means the store is
    /// unavailable or the worker could not be started.
    pub async fn launch(
        &self,
        function_name: &str,
        raw_arguments: &Map<String, Value>,
    ) -> Result<LaunchResult> {
        let _gate = self.launch_gate.read().await;
        if !self.is_accepting() {
            return Ok(LaunchResult::rejected(
                Rejection::ShuttingDown,
                "Server is shutting down",
            ));
        }

        let Some(definition) = self.registry.lookup(function_name) else {
            return Ok(LaunchResult::rejected(
                Rejection::UnknownFunction,
                format!("Function not found: {}", function_name),
            ));
        };

        let arguments = match build_call_arguments(&definition.arg_definitions, raw_arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                info!("Rejected {}: {}", function_name, e);
                return Ok(LaunchResult::rejected(Rejection::Validation, e.to_string()));
            }
        };

        let task_id = Uuid::new_v4().to_string();
        let limit = definition.max_concurrency;
        let admission = {
            let task_id = task_id.clone();
            let name = function_name.to_string();
            self.with_store(move |store| store.admit_and_create(&task_id, &name, limit))
                .await?
        };

        if let Admission::Rejected { running, limit } = admission {
            debug!("{} is at capacity ({}/{})", function_name, running, limit);
            return Ok(LaunchResult::rejected(
                Rejection::OverConcurrency,
                format!("Over Max Concurrency {}", limit),
            ));
        }

        if let Err(e) = self
            .executor
            .spawn(&task_id, function_name, &self.entry_point, &arguments)
            .await
        {
            warn!("Failed to start task {}: {}", task_id, e);
            let reason = e.to_string();
            let id = task_id.clone();
            if let Err(store_err) = self
                .with_store(move |store| store.force_fail(&id, &reason))
                .await
            {
                warn!("Failed to record start failure of {}: {}", task_id, store_err);
            }
            return Err(e);
        }

        info!("Launched {} as task {}", function_name, task_id);
        Ok(LaunchResult::accepted(task_id))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_status(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let task_id = task_id.to_string();
        self.with_store(move |store| store.get(&task_id)).await
    }

    pub async fn list_by_function(&self, function_name: &str) -> Result<Vec<TaskRecord>> {
        let name = function_name.to_string();
        self.with_store(move |store| store.list(&name)).await
    }

    /// Running tasks of a function; `None` for an unknown function
    pub async fn current_running_count(&self, function_name: &str) -> Result<Option<u32>> {
        if !self.registry.contains(function_name) {
            return Ok(None);
        }
        let name = function_name.to_string();
        self.with_store(move |store| store.count_running(&name))
            .await
            .map(Some)
    }

    /// Poll until the task is terminal; `None` if the record disappears
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        poll_interval: Duration,
    ) -> Result<Option<TaskRecord>> {
        loop {
            match self.get_status(task_id).await? {
                None => return Ok(None),
                Some(record) if record.is_done() => return Ok(Some(record)),
                Some(_) => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Kill the worker and fail the record; a no-op for finished or unknown tasks
    pub async fn terminate_task(&self, task_id: &str) -> Result<bool> {
        let _gate = self.launch_gate.write().await;
        let killed = self.executor.terminate(task_id).await;

        let id = task_id.to_string();
        let failed = self
            .with_store(move |store| store.force_fail(&id, MANUAL_TERMINATION))
            .await?;

        if killed || failed {
            info!("Terminated task {}", task_id);
        }
        Ok(failed)
    }

    /// Terminate every running task of a function; returns how many records changed
    pub async fn terminate_function(&self, function_name: &str) -> Result<usize> {
        let _gate = self.launch_gate.write().await;
        let killed = self.executor.terminate_all(function_name).await;

        let name = function_name.to_string();
        let failed = self
            .with_store(move |store| store.force_fail_all(&name, MANUAL_TERMINATION))
            .await?;

        if killed > 0 || failed > 0 {
            info!(
                "Terminated {} tasks of {} ({} workers killed)",
                failed, function_name, killed
            );
        }
        Ok(failed)
    }

    // ========================================================================
    // Timeout reaper
    // ========================================================================

    /// Kill and time out every task running longer than its function allows
    pub async fn reap_timeouts(&self) -> Result<usize> {
        let _gate = self.launch_gate.write().await;
        let mut reaped = 0;

        for definition in self.registry.definitions() {
            let name = definition.function_name.clone();
            let running = self
                .with_store(move |store| store.list_running(&name))
                .await?;

            let now = Utc::now();
            let timeout = definition.timeout();
            for record in running.into_iter().filter(|r| r.age(now) > timeout) {
                self.executor.terminate(&record.task_id).await;

                let id = record.task_id.clone();
                if self.with_store(move |store| store.force_timeout(&id)).await? {
                    warn!(
                        "Task {} of {} timed out after {}s",
                        record.task_id,
                        definition.function_name,
                        timeout.as_secs()
                    );
                    reaped += 1;
                }
            }
        }

        self.executor.reap_finished().await;
        Ok(reaped)
    }

    /// Run `reap_timeouts` every `interval` until the handle is aborted
    pub fn start_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval_timer.tick().await;

                match self.reap_timeouts().await {
                    Ok(0) => {}
                    Ok(reaped) => debug!("Reaper: {} tasks timed out", reaped),
                    Err(e) => warn!("Reaper failed, retrying next interval: {}", e),
                }
            }
        })
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting launches, then join or kill every worker and fail
    /// whatever is still recorded as running.
    ///
    /// A `Terminate` shutdown may run while a `Join` shutdown is waiting; it
    /// ends the wait.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<usize> {
        {
            // In-flight launches finish spawning; later ones see the flag
            let _gate = self.launch_gate.write().await;
            self.accepting.store(false, Ordering::SeqCst);
        }
        info!("Shutting down ({})", mode);

        match mode {
            ShutdownMode::Join => self.executor.drain().await,
            ShutdownMode::Terminate => {
                self.executor.kill_all().await;
            }
        }

        let mut failed = 0;
        for name in self.registry.names() {
            let name = name.to_string();
            failed += self
                .with_store(move |store| store.force_fail_all(&name, SERVER_SHUTDOWN))
                .await?;
        }

        if failed > 0 {
            info!("Marked {} unfinished tasks as failed", failed);
        }
        Ok(failed)
    }
}
