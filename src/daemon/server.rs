//! Daemon event loop and request dispatch.
//!
//! A single thread owns all state. Concurrency comes only from
//! multiplexing I/O across client sockets through one poll set: the
//! listening socket, every accepted connection, and a waker that doubles
//! as the stop signal. Exactly one request is processed per readiness
//! event; handlers run to completion synchronously and may write to other
//! sockets to release waiters or fan out watch notifications.
//!
//! Accepted sockets stay in blocking mode: the poller only detects the
//! opcode byte, after which the handler reads the rest of the request with
//! exact blocking reads. A peer that stalls mid-request can therefore
//! wedge the loop; values are small control blobs, so this is accepted.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;

use super::state::{ChangeKind, ConnId, Mutation, StoreState, WaitOutcome};
use crate::wire::{self, Opcode, WatchTag, WireError};

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);
const FIRST_CONN: ConnId = 2;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("poller setup failed: {0}")]
    Poller(#[source] std::io::Error),
}

/// Handle to a running daemon thread.
///
/// `shutdown` (or drop) sets the stop flag, wakes the poll and joins the
/// thread; all accepted sockets close and in-flight WAIT clients observe a
/// lost connection.
pub struct DaemonHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl DaemonHandle {
    /// The bound address, with any ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the daemon and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if let Err(err) = self.waker.wake() {
                tracing::warn!("failed to wake daemon for shutdown: {err}");
            }
            let _ = thread.join();
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind `addr` and spawn the daemon thread.
pub fn spawn(addr: SocketAddr) -> Result<DaemonHandle, DaemonError> {
    let listener = TcpListener::bind(addr).map_err(|source| DaemonError::Bind { addr, source })?;
    listener.set_nonblocking(true).map_err(DaemonError::Poller)?;
    let local_addr = listener.local_addr().map_err(DaemonError::Poller)?;

    let poll = Poll::new().map_err(DaemonError::Poller)?;
    poll.registry()
        .register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )
        .map_err(DaemonError::Poller)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(DaemonError::Poller)?);
    let stop = Arc::new(AtomicBool::new(false));

    let daemon = Daemon {
        poll,
        listener,
        conns: HashMap::new(),
        next_conn: FIRST_CONN,
        state: StoreState::new(),
        stop: stop.clone(),
    };
    let thread = std::thread::spawn(move || daemon.run());

    Ok(DaemonHandle {
        stop,
        waker,
        thread: Some(thread),
        local_addr,
    })
}

/// A decoded request, read in full before any state is touched.
enum Request {
    Set { key: Vec<u8>, value: Vec<u8> },
    CompareSet {
        key: Vec<u8>,
        expected: Vec<u8>,
        desired: Vec<u8>,
    },
    Get { key: Vec<u8> },
    Add { key: Vec<u8>, delta: i64 },
    Check { keys: Vec<Vec<u8>> },
    Wait { keys: Vec<Vec<u8>> },
    GetNumKeys,
    DeleteKey { key: Vec<u8> },
    WatchKey { key: Vec<u8> },
}

fn read_request(op: Opcode, r: &mut TcpStream) -> Result<Request, WireError> {
    match op {
        Opcode::Set => Ok(Request::Set {
            key: wire::read_bytes(r)?,
            value: wire::read_bytes(r)?,
        }),
        Opcode::CompareSet => Ok(Request::CompareSet {
            key: wire::read_bytes(r)?,
            expected: wire::read_bytes(r)?,
            desired: wire::read_bytes(r)?,
        }),
        Opcode::Get => Ok(Request::Get {
            key: wire::read_bytes(r)?,
        }),
        Opcode::Add => Ok(Request::Add {
            key: wire::read_bytes(r)?,
            delta: wire::read_i64(r)?,
        }),
        Opcode::Check => Ok(Request::Check {
            keys: wire::read_key_vec(r)?,
        }),
        Opcode::Wait => Ok(Request::Wait {
            keys: wire::read_key_vec(r)?,
        }),
        Opcode::GetNumKeys => Ok(Request::GetNumKeys),
        Opcode::DeleteKey => Ok(Request::DeleteKey {
            key: wire::read_bytes(r)?,
        }),
        Opcode::WatchKey => Ok(Request::WatchKey {
            key: wire::read_bytes(r)?,
        }),
    }
}

struct Daemon {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<ConnId, TcpStream>,
    next_conn: ConnId,
    state: StoreState,
    stop: Arc<AtomicBool>,
}

impl Daemon {
    fn run(mut self) {
        tracing::info!(addr = %self.local_addr_display(), "store daemon listening");
        let mut events = Events::with_capacity(128);
        'outer: loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("poll failed, stopping daemon: {err}");
                break;
            }
            for event in events.iter() {
                match event.token() {
                    WAKER => {
                        if self.stop.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                    }
                    LISTENER => self.accept_ready(),
                    Token(conn) => self.conn_ready(conn, event.is_read_closed()),
                }
            }
        }
        // Closing the sockets here is what in-flight WAIT clients observe
        // as a lost connection.
        self.conns.clear();
        tracing::info!("store daemon stopped");
    }

    fn local_addr_display(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.register_conn(stream) {
                    Ok(conn) => tracing::debug!(conn, %peer, "accepted connection"),
                    Err(err) => tracing::warn!(%peer, "failed to register connection: {err}"),
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn register_conn(&mut self, stream: TcpStream) -> std::io::Result<ConnId> {
        // Handlers rely on exact blocking reads; only readiness detection
        // is non-blocking.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let conn = self.next_conn;
        self.next_conn += 1;
        self.poll.registry().register(
            &mut SourceFd(&stream.as_raw_fd()),
            Token(conn),
            Interest::READABLE,
        )?;
        self.conns.insert(conn, stream);
        Ok(conn)
    }

    fn drop_conn(&mut self, conn: ConnId) {
        self.state.disconnect(conn);
        if let Some(stream) = self.conns.remove(&conn) {
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&stream.as_raw_fd()));
        }
    }

    fn conn_ready(&mut self, conn: ConnId, read_closed: bool) {
        loop {
            match self.handle_request(conn) {
                // One request per readiness event on a live connection.
                // A read-closed peer gets no further events, so its final
                // buffered requests are drained here until the EOF; reads
                // cannot block once the peer has shut down its side.
                Ok(true) if read_closed => continue,
                Ok(true) => break,
                Ok(false) => {
                    tracing::debug!(conn, "peer disconnected");
                    self.drop_conn(conn);
                    break;
                }
                Err(err) => {
                    tracing::warn!(conn, "dropping connection: {err}");
                    self.drop_conn(conn);
                    break;
                }
            }
        }
    }

    /// Read and process exactly one request. `Ok(false)` means the
    /// connection is finished: the peer closed cleanly before sending an
    /// opcode, or it was already dropped by an earlier handler fanning
    /// out writes.
    fn handle_request(&mut self, conn: ConnId) -> Result<bool, WireError> {
        let request = {
            let Some(stream) = self.conns.get_mut(&conn) else {
                return Ok(false);
            };
            let Some(op) = wire::read_opcode(stream)? else {
                return Ok(false);
            };
            read_request(op, stream)?
        };
        self.dispatch(conn, request)?;
        Ok(true)
    }

    fn dispatch(&mut self, conn: ConnId, request: Request) -> Result<(), WireError> {
        match request {
            Request::Set { key, value } => {
                let mutation = self.state.set(key, value);
                self.broadcast(mutation);
                Ok(())
            }
            Request::CompareSet {
                key,
                expected,
                desired,
            } => {
                let (current, mutation) = self.state.compare_set(key, expected, desired);
                let mut buf = Vec::new();
                wire::put_bytes(&mut buf, &current);
                self.reply(conn, &buf)?;
                if let Some(mutation) = mutation {
                    self.broadcast(mutation);
                }
                Ok(())
            }
            Request::Get { key } => match self.state.get(&key) {
                Some(value) => {
                    let mut buf = Vec::new();
                    wire::put_bytes(&mut buf, value);
                    self.reply(conn, &buf)
                }
                None => Err(WireError::Protocol(format!(
                    "GET on missing key {:?}",
                    String::from_utf8_lossy(&key)
                ))),
            },
            Request::Add { key, delta } => {
                let (sum, mutation) = self.state.add(key, delta);
                let mut buf = Vec::new();
                wire::put_i64(&mut buf, sum);
                self.reply(conn, &buf)?;
                self.broadcast(mutation);
                Ok(())
            }
            Request::Check { keys } => {
                let byte = if self.state.check(&keys) {
                    wire::CHECK_READY
                } else {
                    wire::CHECK_NOT_READY
                };
                self.reply(conn, &[byte])
            }
            Request::Wait { keys } => match self.state.register_wait(conn, keys) {
                WaitOutcome::Satisfied => self.reply(conn, &[wire::STOP_WAITING]),
                WaitOutcome::Registered => Ok(()),
            },
            Request::GetNumKeys => {
                let mut buf = Vec::new();
                wire::put_i64(&mut buf, self.state.num_keys());
                self.reply(conn, &buf)
            }
            Request::DeleteKey { key } => {
                let (deleted, mutation) = self.state.delete(key);
                let byte = if deleted {
                    wire::DELETE_DONE
                } else {
                    wire::DELETE_MISSING
                };
                self.reply(conn, &[byte])?;
                // Deletion notifies watchers but never wakes waiters.
                if let Some(mutation) = mutation {
                    self.notify_watchers(&mutation);
                }
                Ok(())
            }
            Request::WatchKey { key } => {
                self.state.watch(conn, key.clone());
                let mut buf = Vec::new();
                wire::put_notification(&mut buf, &key, &[], &[], WatchTag::Ack);
                self.reply(conn, &buf)
            }
        }
    }

    /// Write a reply to the requesting connection. A write failure here
    /// propagates so the caller drops the connection.
    fn reply(&mut self, conn: ConnId, buf: &[u8]) -> Result<(), WireError> {
        let Some(stream) = self.conns.get_mut(&conn) else {
            return Ok(());
        };
        wire::send(stream, buf)
    }

    fn broadcast(&mut self, mutation: Mutation) {
        self.wake_waiters(&mutation.key);
        self.notify_watchers(&mutation);
    }

    /// Release every WAIT that the mutation of `key` fully satisfied.
    /// Write failures mark the target dead without affecting the requester.
    fn wake_waiters(&mut self, key: &[u8]) {
        let released = self.state.consume_waiters(key);
        let mut dead = Vec::new();
        for conn in released {
            let Some(stream) = self.conns.get_mut(&conn) else {
                continue;
            };
            if let Err(err) = wire::send(stream, &[wire::STOP_WAITING]) {
                tracing::warn!(conn, "failed to release waiter: {err}");
                dead.push(conn);
            }
        }
        for conn in dead {
            self.drop_conn(conn);
        }
    }

    /// Fan one notification frame out to every watcher of the mutated key.
    /// Fire-and-forget: a slow watcher stalls the write, a dead one is
    /// dropped.
    fn notify_watchers(&mut self, mutation: &Mutation) {
        let watchers = self.state.watchers_of(&mutation.key).to_vec();
        if watchers.is_empty() {
            return;
        }
        let tag = match mutation.kind {
            ChangeKind::Created => WatchTag::Created,
            ChangeKind::Updated => WatchTag::Updated,
            ChangeKind::Appended => WatchTag::Appended,
            ChangeKind::Deleted => WatchTag::Deleted,
        };
        let mut frame = Vec::new();
        wire::put_notification(
            &mut frame,
            &mutation.key,
            mutation.old.as_deref().unwrap_or(&[]),
            mutation.new.as_deref().unwrap_or(&[]),
            tag,
        );
        let mut dead = Vec::new();
        for conn in watchers {
            let Some(stream) = self.conns.get_mut(&conn) else {
                continue;
            };
            if let Err(err) = wire::send(stream, &frame) {
                tracing::warn!(conn, "failed to notify watcher: {err}");
                dead.push(conn);
            }
        }
        for conn in dead {
            self.drop_conn(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;

    fn connect(handle: &DaemonHandle) -> TcpStream {
        let stream = TcpStream::connect(handle.local_addr()).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    fn send_set(stream: &mut TcpStream, key: &[u8], value: &[u8]) {
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Set as u8);
        wire::put_bytes(&mut buf, key);
        wire::put_bytes(&mut buf, value);
        wire::send(stream, &buf).expect("send set");
    }

    fn send_get(stream: &mut TcpStream, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Get as u8);
        wire::put_bytes(&mut buf, key);
        wire::send(stream, &buf).expect("send get");
        wire::read_bytes(stream).expect("get reply")
    }

    fn spawn_daemon() -> DaemonHandle {
        spawn("127.0.0.1:0".parse().expect("addr")).expect("spawn daemon")
    }

    #[test]
    fn set_then_get_round_trips_on_the_wire() {
        let handle = spawn_daemon();
        let mut stream = connect(&handle);
        send_set(&mut stream, b"k", b"v");
        assert_eq!(send_get(&mut stream, b"k"), b"v");
    }

    #[test]
    fn add_replies_with_running_total() {
        let handle = spawn_daemon();
        let mut stream = connect(&handle);
        for expected in [2i64, 4, 6] {
            let mut buf = Vec::new();
            wire::put_u8(&mut buf, Opcode::Add as u8);
            wire::put_bytes(&mut buf, b"counter");
            wire::put_i64(&mut buf, 2);
            wire::send(&mut stream, &buf).expect("send add");
            assert_eq!(wire::read_i64(&mut stream).expect("add reply"), expected);
        }
        assert_eq!(send_get(&mut stream, b"counter"), b"6");
    }

    #[test]
    fn wait_blocks_until_another_connection_sets() {
        let handle = spawn_daemon();
        let mut waiter = connect(&handle);
        let mut writer = connect(&handle);

        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Wait as u8);
        wire::put_key_vec(&mut buf, &[b"pending".to_vec()]);
        wire::send(&mut waiter, &buf).expect("send wait");

        // No STOP_WAITING yet.
        waiter
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("read timeout");
        let mut byte = [0u8; 1];
        assert!(waiter.read_exact(&mut byte).is_err());

        send_set(&mut writer, b"pending", b"done");

        waiter
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        assert_eq!(wire::read_u8(&mut waiter).expect("wake"), wire::STOP_WAITING);
    }

    #[test]
    fn unknown_opcode_closes_the_connection() {
        let handle = spawn_daemon();
        let mut stream = connect(&handle);
        wire::send(&mut stream, &[0x7f]).expect("send junk");
        // The daemon drops us; the read observes EOF.
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).expect("eof"), 0);
    }

    #[test]
    fn get_on_missing_key_is_a_protocol_error() {
        let handle = spawn_daemon();
        let mut stream = connect(&handle);
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Get as u8);
        wire::put_bytes(&mut buf, b"missing");
        wire::send(&mut stream, &buf).expect("send get");
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).expect("eof"), 0);
    }

    #[test]
    fn shutdown_joins_and_closes_clients() {
        let mut handle = spawn_daemon();
        let mut stream = connect(&handle);
        handle.shutdown();
        let mut byte = [0u8; 1];
        // Either EOF or reset, but never a hang.
        let _ = stream.read(&mut byte);
    }
}
