//! Local process executor - one OS process per running task
//!
//! Workers report their outcome through the task store, never back to the
//! executor. The executor only owns the processes:
//! - spawning with the worker environment and the arguments on stdin
//! - reaping processes that exited on their own
//! - force-killing on termination, timeout and shutdown

use super::entry::{EntryPoint, ENV_FUNCTION, ENV_STORE, ENV_TASK_ID};
use crate::function::CallArguments;
use fnjob_foundation::{Error, Result, TaskStoreSettings};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How often `drain` checks for exited workers
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A live worker process
struct WorkerHandle {
    function_name: String,
    child: Child,
    started_at: Instant,
}

/// Owner of every worker process spawned by this server
pub struct ProcessExecutor {
    /// Running workers by task ID
    workers: Mutex<HashMap<String, WorkerHandle>>,

    /// Handed to workers so they open the same store
    store: TaskStoreSettings,
}

impl ProcessExecutor {
    pub fn new(store: TaskStoreSettings) -> Self {
        Self {
            workers: Mutex::new(HashMap::with_capacity(16)),
            store,
        }
    }

    /// Start a worker for `task_id`.
    ///
    /// The worker gets the task identity and store settings in its
    /// environment and `arguments` as a JSON object on stdin.
    pub async fn spawn(
        &self,
        task_id: &str,
        function_name: &str,
        entry_point: &EntryPoint,
        arguments: &CallArguments,
    ) -> Result<()> {
        let payload = serde_json::to_vec(arguments)?;
        let store = serde_json::to_string(&self.store)?;

        let mut cmd = Command::new(&entry_point.program);
        cmd.args(&entry_point.args)
            .env(ENV_TASK_ID, task_id)
            .env(ENV_FUNCTION, function_name)
            .env(ENV_STORE, store)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!("Spawning worker for task {}: {}", task_id, entry_point);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Task(format!("Failed to spawn worker: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // The worker exited before reading; it reports through the store
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Worker for task {} closed stdin early", task_id);
                }
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(Error::Task(format!(
                        "Failed to send arguments to worker: {}",
                        e
                    )));
                }
            }
            // Dropping stdin closes the pipe so the worker sees EOF
        }

        info!(
            "Started worker for task {} ({}) pid={:?}",
            task_id,
            function_name,
            child.id()
        );

        self.workers.lock().await.insert(
            task_id.to_string(),
            WorkerHandle {
                function_name: function_name.to_string(),
                child,
                started_at: Instant::now(),
            },
        );

        self.reap_finished().await;
        Ok(())
    }

    /// Drop handles of workers that already exited; returns how many
    pub async fn reap_finished(&self) -> usize {
        let mut workers = self.workers.lock().await;

        let exited: Vec<String> = workers
            .iter_mut()
            .filter_map(|(task_id, handle)| match handle.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(
                        "Worker for task {} exited with {} after {:.1}s",
                        task_id,
                        status,
                        handle.started_at.elapsed().as_secs_f64()
                    );
                    Some(task_id.clone())
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to poll worker for task {}: {}", task_id, e);
                    Some(task_id.clone())
                }
            })
            .collect();

        for task_id in &exited {
            workers.remove(task_id);
        }
        exited.len()
    }

    /// Kill the worker of `task_id`; `false` if there was nothing to kill
    pub async fn terminate(&self, task_id: &str) -> bool {
        let handle = self.workers.lock().await.remove(task_id);
        match handle {
            Some(handle) => kill_worker(task_id, handle).await,
            None => false,
        }
    }

    /// Kill every worker of `function_name`; returns how many were alive
    pub async fn terminate_all(&self, function_name: &str) -> usize {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.lock().await;
            let ids: Vec<String> = workers
                .iter()
                .filter(|(_, h)| h.function_name == function_name)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|h| (id, h)))
                .collect()
        };

        kill_workers(handles).await
    }

    /// Kill every tracked worker; returns how many were alive
    pub async fn kill_all(&self) -> usize {
        let handles: Vec<(String, WorkerHandle)> = self.workers.lock().await.drain().collect();
        let killed = kill_workers(handles).await;
        if killed > 0 {
            info!("Killed {} workers", killed);
        }
        killed
    }

    /// Wait until every tracked worker has exited.
    ///
    /// The lock is released between polls, so a concurrent `kill_all` ends
    /// the wait early.
    pub async fn drain(&self) {
        loop {
            self.reap_finished().await;
            let remaining = self.workers.lock().await.len();
            if remaining == 0 {
                break;
            }
            debug!("Waiting for {} workers", remaining);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Task IDs with a tracked worker
    pub async fn tracked(&self) -> Vec<String> {
        self.workers.lock().await.keys().cloned().collect()
    }

    pub async fn is_tracked(&self, task_id: &str) -> bool {
        self.workers.lock().await.contains_key(task_id)
    }
}

async fn kill_workers(handles: Vec<(String, WorkerHandle)>) -> usize {
    let mut killed = 0;
    for (task_id, handle) in handles {
        if kill_worker(&task_id, handle).await {
            killed += 1;
        }
    }
    killed
}

/// Kill and join one worker; `false` if it had already exited
async fn kill_worker(task_id: &str, mut handle: WorkerHandle) -> bool {
    if let Ok(Some(_)) = handle.child.try_wait() {
        return false;
    }

    // kill() also waits for the process, so nothing is left behind
    if let Err(e) = handle.child.kill().await {
        debug!("Failed to kill worker for task {}: {}", task_id, e);
    }
    info!("Force killed worker for task {}", task_id);
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(TaskStoreSettings::default())
    }

    fn sleep(secs: &str) -> EntryPoint {
        EntryPoint::new("sleep").arg(secs)
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let executor = executor();
        executor
            .spawn("t1", "quick", &sleep("0.2"), &CallArguments::new())
            .await
            .unwrap();
        assert!(executor.is_tracked("t1").await);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(executor.reap_finished().await, 1);
        assert!(!executor.is_tracked("t1").await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor = executor();
        let result = executor
            .spawn(
                "t1",
                "missing",
                &EntryPoint::new("/nonexistent/fnjob-worker"),
                &CallArguments::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::Task(_))));
        assert!(executor.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let executor = executor();
        executor
            .spawn("t1", "slow", &sleep("30"), &CallArguments::new())
            .await
            .unwrap();
        assert!(executor.is_tracked("t1").await);

        assert!(executor.terminate("t1").await);
        assert!(!executor.terminate("t1").await);
        assert!(!executor.terminate("unknown").await);
        assert!(executor.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_by_function() {
        let executor = executor();
        for id in ["a", "b"] {
            executor
                .spawn(id, "slow", &sleep("30"), &CallArguments::new())
                .await
                .unwrap();
        }
        executor
            .spawn("c", "other", &sleep("30"), &CallArguments::new())
            .await
            .unwrap();

        assert_eq!(executor.terminate_all("slow").await, 2);
        assert_eq!(executor.tracked().await, vec!["c".to_string()]);
        assert_eq!(executor.kill_all().await, 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_exit() {
        let executor = executor();
        executor
            .spawn("t1", "short", &sleep("0.3"), &CallArguments::new())
            .await
            .unwrap();

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), executor.drain())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(executor.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn test_kill_all_interrupts_drain() {
        let executor = std::sync::Arc::new(executor());
        executor
            .spawn("t1", "slow", &sleep("30"), &CallArguments::new())
            .await
            .unwrap();

        let draining = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.kill_all().await, 1);

        tokio::time::timeout(Duration::from_secs(5), draining)
            .await
            .unwrap()
            .unwrap();
    }
}
