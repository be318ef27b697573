//! In-memory daemon state: the primary store plus the waiter and watcher
//! registries.
//!
//! This is pure bookkeeping; the event loop in [`super::server`] owns the
//! sockets and turns the outcomes reported here into replies, wake-ups and
//! notifications. Connections are identified by an opaque [`ConnId`]
//! assigned at accept time.
//!
//! Coupled invariant between the registries: a connection with `n > 0`
//! awaited keys appears in exactly `n` distinct per-key waiter lists, none
//! of which are present in the primary store. Every path that touches one
//! map updates the other, including [`StoreState::disconnect`].

use std::collections::HashMap;

/// Daemon-side identity of an accepted socket.
pub type ConnId = usize;

/// How a mutation changed a key, as reported to watchers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Appended,
    Deleted,
}

/// A state change that watchers of the key must hear about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub key: Vec<u8>,
    /// Previous value; `None` if the key did not exist.
    pub old: Option<Vec<u8>>,
    /// New value; `None` for a deletion.
    pub new: Option<Vec<u8>>,
    pub kind: ChangeKind,
}

/// Result of registering a WAIT request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every requested key already exists; reply immediately.
    Satisfied,
    /// The connection is now registered against each missing key.
    Registered,
}

#[derive(Default)]
pub struct StoreState {
    kv: HashMap<Vec<u8>, Vec<u8>>,
    /// key -> connections blocked waiting for the key to exist, in arrival
    /// order. Consumed wholesale on the first mutation of the key.
    waiting: HashMap<Vec<u8>, Vec<ConnId>>,
    /// connection -> number of still-missing keys from its current WAIT.
    awaited: HashMap<ConnId, usize>,
    /// key -> connections subscribed to change notifications. Persistent
    /// until the connection goes away.
    watchers: HashMap<Vec<u8>, Vec<ConnId>>,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.kv.get(key)
    }

    pub fn num_keys(&self) -> i64 {
        self.kv.len() as i64
    }

    pub fn check(&self, keys: &[Vec<u8>]) -> bool {
        keys.iter().all(|key| self.kv.contains_key(key.as_slice()))
    }

    /// Unconditional overwrite.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Mutation {
        let old = self.kv.insert(key.clone(), value.clone());
        let kind = if old.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        Mutation {
            key,
            old,
            new: Some(value),
            kind,
        }
    }

    /// Compare-and-set. Returns the reply value and, when state changed,
    /// the mutation to broadcast.
    ///
    /// The reply is the new current value on success; on failure it is the
    /// untouched current value, except for the absent-key/non-empty-expected
    /// case where `expected` itself is echoed as the failure sentinel.
    pub fn compare_set(
        &mut self,
        key: Vec<u8>,
        expected: Vec<u8>,
        desired: Vec<u8>,
    ) -> (Vec<u8>, Option<Mutation>) {
        match self.kv.get(&key) {
            None => {
                if expected.is_empty() {
                    self.kv.insert(key.clone(), desired.clone());
                    let mutation = Mutation {
                        key,
                        old: None,
                        new: Some(desired.clone()),
                        kind: ChangeKind::Created,
                    };
                    (desired, Some(mutation))
                } else {
                    // Key not created yet; echo `expected` so the caller can
                    // tell this apart from a successful swap.
                    (expected, None)
                }
            }
            Some(current) if *current == expected => {
                let old = self.kv.insert(key.clone(), desired.clone());
                let mutation = Mutation {
                    key,
                    old,
                    new: Some(desired.clone()),
                    kind: ChangeKind::Updated,
                };
                (desired, Some(mutation))
            }
            Some(current) => (current.clone(), None),
        }
    }

    /// Atomic decimal accumulate. A missing key counts as 0; an existing
    /// value that does not parse as decimal is treated as 0 and overwritten.
    /// The accumulator wraps on overflow.
    pub fn add(&mut self, key: Vec<u8>, delta: i64) -> (i64, Mutation) {
        let old = self.kv.get(&key).cloned();
        let base = match &old {
            None => 0,
            Some(bytes) => parse_counter(bytes).unwrap_or_else(|| {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    "ADD on non-numeric value, treating as 0"
                );
                0
            }),
        };
        let sum = base.wrapping_add(delta);
        let rendered = sum.to_string().into_bytes();
        self.kv.insert(key.clone(), rendered.clone());
        let kind = if old.is_some() {
            ChangeKind::Appended
        } else {
            ChangeKind::Created
        };
        let mutation = Mutation {
            key,
            old,
            new: Some(rendered),
            kind,
        };
        (sum, mutation)
    }

    /// Returns whether the key existed, and the deletion to broadcast.
    /// Deletion never wakes waiters (waiters want presence, not change).
    pub fn delete(&mut self, key: Vec<u8>) -> (bool, Option<Mutation>) {
        match self.kv.remove(&key) {
            Some(old) => {
                let mutation = Mutation {
                    key,
                    old: Some(old),
                    new: None,
                    kind: ChangeKind::Deleted,
                };
                (true, Some(mutation))
            }
            None => (false, None),
        }
    }

    /// Register a WAIT. Already-present keys count as satisfied without
    /// registering; duplicate keys in the request are collapsed.
    pub fn register_wait(&mut self, conn: ConnId, keys: Vec<Vec<u8>>) -> WaitOutcome {
        let mut missing = 0usize;
        for key in keys {
            if self.kv.contains_key(&key) {
                continue;
            }
            let list = self.waiting.entry(key).or_default();
            if list.contains(&conn) {
                continue;
            }
            list.push(conn);
            missing += 1;
        }
        if missing == 0 {
            WaitOutcome::Satisfied
        } else {
            self.awaited.insert(conn, missing);
            WaitOutcome::Registered
        }
    }

    /// Consume the waiter list for a just-mutated key. Returns the
    /// connections whose WAIT is now fully satisfied and should be
    /// released. The per-key list is dropped wholesale: each connection
    /// waits on each key at most once per WAIT.
    pub fn consume_waiters(&mut self, key: &[u8]) -> Vec<ConnId> {
        let Some(conns) = self.waiting.remove(key) else {
            return Vec::new();
        };
        let mut released = Vec::new();
        for conn in conns {
            if let Some(count) = self.awaited.get_mut(&conn) {
                *count -= 1;
                if *count == 0 {
                    self.awaited.remove(&conn);
                    released.push(conn);
                }
            }
        }
        released
    }

    /// Subscribe a connection to change notifications for a key.
    pub fn watch(&mut self, conn: ConnId, key: Vec<u8>) {
        let list = self.watchers.entry(key).or_default();
        if !list.contains(&conn) {
            list.push(conn);
        }
    }

    pub fn watchers_of(&self, key: &[u8]) -> &[ConnId] {
        self.watchers.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forget a connection entirely: drop it from every waiter list, its
    /// outstanding-count entry, and every watcher list. Both registry maps
    /// are updated together so the coupled invariant holds across abrupt
    /// disconnects.
    pub fn disconnect(&mut self, conn: ConnId) {
        self.waiting.retain(|_, conns| {
            conns.retain(|c| *c != conn);
            !conns.is_empty()
        });
        self.awaited.remove(&conn);
        self.watchers.retain(|_, conns| {
            conns.retain(|c| *c != conn);
            !conns.is_empty()
        });
    }

    #[cfg(test)]
    fn awaited_count(&self, conn: ConnId) -> Option<usize> {
        self.awaited.get(&conn).copied()
    }
}

fn parse_counter(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}
