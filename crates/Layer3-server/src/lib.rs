//! # fnjob-server
//!
//! HTTP API over a [`fnjob_task::JobDispatcher`]: launch functions, poll
//! and list tasks, terminate them, inspect the registry.

pub mod routes;
pub mod server;

pub use routes::{router, ApiError, AppState, API_PATHS};
pub use server::{serve, serve_with_shutdown, shutdown_on_signal};
