use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::daemon::DaemonError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; callers who care about the
/// distinction match on the variant, everyone else formats it.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// True when the operation gave up on a deadline rather than failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Client(ClientError::Timeout { .. }))
    }
}
