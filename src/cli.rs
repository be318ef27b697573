//! `musterd` command line: run a standalone store daemon.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::{Result, config, daemon};

#[derive(Parser, Debug)]
#[command(
    name = "musterd",
    about = "Rendezvous key/value store daemon",
    version
)]
pub struct Cli {
    /// Bind address. Overrides the config file.
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// TCP port. Overrides the config file.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a TOML config file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: info, -vv: debug).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the daemon until SIGINT/SIGTERM, then shut it down cleanly.
pub fn run(cli: Cli) -> Result<()> {
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());

    let mut handle = daemon::spawn(cfg.addr()?)?;
    tracing::info!(addr = %handle.local_addr(), "musterd running");

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    handle.shutdown();
    Ok(())
}
