//! Public store façade: config-driven construction, key prefixing and the
//! worker rendezvous.
//!
//! A `Store` is a value holding its client (two sockets plus the listener
//! thread) and, in the server-hosting process, the daemon handle. All
//! user-level keys are transparently prefixed so the rendezvous counter
//! lives in its own namespace; the daemon is oblivious to prefixes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::client::{Client, ClientError, WatchCallback};
use crate::config::StoreConfig;
use crate::daemon::{self, DaemonHandle};
use crate::{Error, Result};

/// Namespace prefix for user-level keys.
const KEY_PREFIX: &str = "/";
/// Join counter for the worker rendezvous; deliberately outside the
/// user-key namespace.
const INIT_KEY: &[u8] = b"init/";

const RENDEZVOUS_POLL: Duration = Duration::from_millis(10);

pub struct Store {
    // Drop order: the client's sockets close and its listener thread joins
    // before the daemon (if any) shuts down.
    client: Client,
    daemon: Option<DaemonHandle>,
    config: StoreConfig,
    addr: SocketAddr,
}

impl Store {
    /// Open a store per `config`: spawn the daemon when `is_server`,
    /// connect the client pair, and, when `wait_workers` and `num_workers`
    /// are set, block until the rendezvous completes.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let (daemon, addr) = if config.is_server {
            let handle = daemon::spawn(config.addr()?)?;
            let addr = handle.local_addr();
            (Some(handle), addr)
        } else {
            (None, config.addr()?)
        };
        let client = Client::connect(addr, config.timeout())?;
        let store = Self {
            client,
            daemon,
            config,
            addr,
        };
        if store.config.wait_workers && store.config.num_workers.is_some() {
            store.wait_for_workers()?;
        }
        Ok(store)
    }

    /// The daemon endpoint, with any ephemeral server port resolved.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_server(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.client.set(&prefixed(key), value)?;
        Ok(())
    }

    /// Blocking read: performs a WAIT on the key first, so reading a key
    /// that does not exist yet blocks until someone writes it (or the
    /// default timeout expires) instead of failing.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = prefixed(key);
        self.client.wait(std::slice::from_ref(&key))?;
        let value = self.client.get(&key)?;
        Ok(value)
    }

    pub fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let sum = self.client.add(&prefixed(key), delta)?;
        Ok(sum)
    }

    /// Compare-and-set; returns the resulting current value. A reply that
    /// differs from `desired` means the swap did not happen.
    pub fn compare_set(&self, key: &str, expected: &[u8], desired: &[u8]) -> Result<Vec<u8>> {
        let current = self
            .client
            .compare_set(&prefixed(key), expected, desired)?;
        Ok(current)
    }

    pub fn delete_key(&self, key: &str) -> Result<bool> {
        let deleted = self.client.delete(&prefixed(key))?;
        Ok(deleted)
    }

    pub fn check(&self, keys: &[&str]) -> Result<bool> {
        let keys: Vec<Vec<u8>> = keys.iter().map(|key| prefixed(key)).collect();
        let ready = self.client.check(&keys)?;
        Ok(ready)
    }

    pub fn wait(&self, keys: &[&str]) -> Result<()> {
        let keys: Vec<Vec<u8>> = keys.iter().map(|key| prefixed(key)).collect();
        self.client.wait(&keys)?;
        Ok(())
    }

    pub fn wait_timeout(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let keys: Vec<Vec<u8>> = keys.iter().map(|key| prefixed(key)).collect();
        self.client.wait_timeout(&keys, timeout)?;
        Ok(())
    }

    /// Total number of keys the daemon holds, the rendezvous counter
    /// included.
    pub fn num_keys(&self) -> Result<i64> {
        let count = self.client.num_keys()?;
        Ok(count)
    }

    pub fn watch_key(&self, key: &str, callback: WatchCallback) -> Result<()> {
        self.client.watch_key(&prefixed(key), callback)?;
        Ok(())
    }

    /// Join the worker rendezvous and block until all `num_workers` have
    /// joined. Runs from `open` when `wait_workers` is set; call it once,
    /// explicitly, otherwise. No-op without a configured worker count.
    ///
    /// Each participant bumps the join counter, then polls it with a short
    /// back-off until it reaches the expected count or the configured
    /// timeout elapses.
    pub fn wait_for_workers(&self) -> Result<()> {
        let Some(expected) = self.config.num_workers else {
            return Ok(());
        };
        let expected = expected as i64;
        let joined = self.client.add(INIT_KEY, 1)?;
        if joined >= expected {
            return Ok(());
        }
        let timeout = self.config.timeout();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            std::thread::sleep(RENDEZVOUS_POLL);
            let raw = self.client.get(INIT_KEY)?;
            let count = parse_counter(&raw).ok_or_else(|| {
                Error::Client(ClientError::Protocol(format!(
                    "malformed worker counter {:?}",
                    String::from_utf8_lossy(&raw)
                )))
            })?;
            if count >= expected {
                return Ok(());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(Error::Client(ClientError::Timeout { waited: timeout }));
            }
        }
    }
}

fn prefixed(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_PREFIX.len() + key.len());
    out.extend_from_slice(KEY_PREFIX.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

fn parse_counter(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_keys_cannot_collide_with_the_rendezvous_counter() {
        assert_ne!(prefixed("init/"), INIT_KEY.to_vec());
        assert_eq!(prefixed("x"), b"/x".to_vec());
    }
}
