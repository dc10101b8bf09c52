//! Launch results

use serde::Serialize;

/// Why a launch was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No function is registered under the name
    UnknownFunction,
    /// An argument is missing or cannot be coerced
    Validation,
    /// The function is already running `max_concurrency` tasks
    OverConcurrency,
    /// The dispatcher no longer accepts launches
    ShuttingDown,
}

/// Reply to a launch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchResult {
    #[serde(rename = "success")]
    pub accepted: bool,
    pub message: String,
    /// Empty unless accepted
    pub task_id: String,

    #[serde(skip)]
    pub rejection: Option<Rejection>,
}

impl LaunchResult {
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: String::new(),
            task_id: task_id.into(),
            rejection: None,
        }
    }

    pub fn rejected(rejection: Rejection, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            task_id: String::new(),
            rejection: Some(rejection),
        }
    }
}
