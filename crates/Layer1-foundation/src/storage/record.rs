//! Task records as persisted in the task store

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Admitted and (possibly) executing
    Running,
    /// Function returned a value
    Done,
    /// Function raised, or the task was terminated
    Failed,
    /// Killed by the reaper after exceeding its timeout
    Timeout,
}

impl TaskStatus {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(TaskStatus::Running),
            "DONE" => Some(TaskStatus::Done),
            "FAILED" => Some(TaskStatus::Failed),
            "TIMEOUT" => Some(TaskStatus::Timeout),
            _ => None,
        }
    }

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub function_name: String,
    pub status: TaskStatus,
    pub result: Value,

    #[serde(skip)]
    pub created_at: DateTime<Utc>,

    /// Unset while running; retention deadline once terminal
    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::Timeout)
    }

    /// How long the task has existed
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// What a worker reports back when its function stops
#[derive(Debug)]
pub enum Outcome {
    /// The function returned; the value may have failed to convert to JSON
    Value(serde_json::Result<Value>),
    /// The function raised (or was terminated) with this message
    Error(String),
}

impl Outcome {
    pub fn value(value: Value) -> Self {
        Outcome::Value(Ok(value))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error(message.into())
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The Running record was created
    Admitted(TaskRecord),
    /// No headroom; nothing was written
    Rejected { running: u32, limit: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_and_terminal() {
        for status in [
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Timeout,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.is_terminal(), status != TaskStatus::Running);
        }
        assert_eq!(TaskStatus::parse("running"), None);
    }

    #[test]
    fn test_record_json_shape() {
        let record = TaskRecord {
            task_id: "abc".into(),
            function_name: "add".into(),
            status: TaskStatus::Done,
            result: serde_json::json!(7),
            created_at: Utc::now(),
            expires_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "task_id": "abc",
                "function_name": "add",
                "status": "DONE",
                "result": 7
            })
        );
    }
}
