//! Config
//!
//! - `server.rs` - ServerConfig, TaskStoreSettings, ShutdownMode
//! - `loader.rs` - layered settings.json loading

mod loader;
mod server;

pub use loader::{merge_json, ConfigLoader, CONFIG_DIR_NAME};
pub use server::{
    ServerConfig, ShutdownMode, TaskStoreSettings, DEFAULT_FUNCTION_TIMEOUT_SECS,
    DEFAULT_RETENTION_SECS,
};
