//! Daemon module - the store service.
//!
//! Provides:
//! - The in-memory key/value state and waiter/watcher registries
//! - The single-threaded poll loop that owns them
//! - A handle for spawning and stopping the daemon thread

pub mod server;
pub mod state;

pub use server::{DaemonError, DaemonHandle, spawn};
pub use state::{ChangeKind, ConnId, Mutation, StoreState, WaitOutcome};
