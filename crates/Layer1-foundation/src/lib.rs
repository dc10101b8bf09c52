//! # fnjob-foundation
//!
//! Foundation layer for fnjob:
//! - Error: workspace-wide error type
//! - Config: server settings and layered settings.json loading
//! - Storage: SQLite task store shared by the server and its workers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  HTTP server (fnjob-server)                          │
//! │                     │                                │
//! │                     ▼                                │
//! │  JobDispatcher (fnjob-task) ── ProcessExecutor       │
//! │                     │                │               │
//! │                     ▼                ▼               │
//! │                TaskStore ◄──── worker processes      │
//! │                (SQLite, WAL)                         │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    merge_json, ConfigLoader, ServerConfig, ShutdownMode, TaskStoreSettings, CONFIG_DIR_NAME,
    DEFAULT_FUNCTION_TIMEOUT_SECS, DEFAULT_RETENTION_SECS,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{Admission, Outcome, TaskRecord, TaskStatus, TaskStore};
