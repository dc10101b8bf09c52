//! Storage
//!
//! - `db`: SQLite task store shared by the server and its worker processes
//! - `record`: task records, statuses and worker outcomes

mod db;
mod record;

pub use db::TaskStore;
pub use record::{Admission, Outcome, TaskRecord, TaskStatus};
