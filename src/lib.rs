#![forbid(unsafe_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod store;
pub mod telemetry;
pub mod wire;

pub use client::{Client, ClientError, WatchCallback};
pub use config::StoreConfig;
pub use daemon::{DaemonError, DaemonHandle};
pub use error::Error;
pub use store::Store;

pub type Result<T> = std::result::Result<T, Error>;
