//! Client transport: a synchronous request socket plus a dedicated
//! listener socket serviced by a background thread.
//!
//! Operations are raw wire round trips; key prefixing and the rendezvous
//! protocol live in [`crate::store`]. The request path takes `&self` and
//! serializes internally, so a client can be shared across threads. Watch
//! callbacks run serially on the listener thread and must not block it.

use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel;
use thiserror::Error;

use crate::wire::{self, Opcode, WatchTag, WireError};

/// Invoked with the watched key's old and new values; `None` encodes
/// prior absence (creation) or removal (deletion).
pub type WatchCallback = Box<dyn FnMut(Option<Vec<u8>>, Option<Vec<u8>>) + Send>;

const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O failure or unexpected EOF. Framing cannot be resynchronized, so
    /// there is no in-band recovery.
    #[error("connection to the store daemon lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    #[error("store operation timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// An earlier timeout abandoned a request mid-reply; a STOP_WAITING
    /// byte may still be en route, so the socket can no longer be framed.
    #[error("request socket poisoned by an earlier timeout; reconnect required")]
    Poisoned,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::ConnectionLost(io) => ClientError::ConnectionLost(io),
            WireError::Protocol(msg) => ClientError::Protocol(msg),
        }
    }
}

#[derive(Default)]
struct WatchShared {
    callbacks: Mutex<HashMap<Vec<u8>, WatchCallback>>,
    /// Senders for WATCH_KEY registrations awaiting their ack frame, in
    /// request order.
    pending_acks: Mutex<VecDeque<channel::Sender<()>>>,
}

/// A connection pair to one daemon.
pub struct Client {
    request: Mutex<TcpStream>,
    listener_stream: TcpStream,
    listener_thread: Option<JoinHandle<()>>,
    watch: Arc<WatchShared>,
    poisoned: AtomicBool,
    timeout: Duration,
}

impl Client {
    /// Connect both sockets, retrying with back-off until `timeout` —
    /// workers routinely race the daemon's startup.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let request = connect_with_retry(addr, timeout)?;
        request.set_nodelay(true).map_err(ClientError::ConnectionLost)?;
        request
            .set_read_timeout(read_timeout(timeout))
            .map_err(ClientError::ConnectionLost)?;

        let listener_stream = connect_with_retry(addr, timeout)?;
        listener_stream
            .set_nodelay(true)
            .map_err(ClientError::ConnectionLost)?;

        let watch = Arc::new(WatchShared::default());
        let thread_stream = listener_stream
            .try_clone()
            .map_err(ClientError::ConnectionLost)?;
        let shared = Arc::clone(&watch);
        let listener_thread = std::thread::spawn(move || run_listener(thread_stream, shared));

        Ok(Self {
            request: Mutex::new(request),
            listener_stream,
            listener_thread: Some(listener_thread),
            watch,
            poisoned: AtomicBool::new(false),
            timeout,
        })
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Set as u8);
        wire::put_bytes(&mut buf, key);
        wire::put_bytes(&mut buf, value);
        wire::send(&mut *stream, &buf).map_err(|err| self.op_failed(err, self.timeout))
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Get as u8);
        wire::put_bytes(&mut buf, key);
        wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_bytes(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))
    }

    pub fn compare_set(
        &self,
        key: &[u8],
        expected: &[u8],
        desired: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::CompareSet as u8);
        wire::put_bytes(&mut buf, key);
        wire::put_bytes(&mut buf, expected);
        wire::put_bytes(&mut buf, desired);
        wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_bytes(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))
    }

    pub fn add(&self, key: &[u8], delta: i64) -> Result<i64, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Add as u8);
        wire::put_bytes(&mut buf, key);
        wire::put_i64(&mut buf, delta);
        wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_i64(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))
    }

    pub fn check(&self, keys: &[Vec<u8>]) -> Result<bool, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Check as u8);
        wire::put_key_vec(&mut buf, keys);
        let byte = wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_u8(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))?;
        match byte {
            wire::CHECK_READY => Ok(true),
            wire::CHECK_NOT_READY => Ok(false),
            other => Err(ClientError::Protocol(format!(
                "unexpected check reply {other:#04x}"
            ))),
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::DeleteKey as u8);
        wire::put_bytes(&mut buf, key);
        let byte = wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_u8(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))?;
        match byte {
            wire::DELETE_DONE => Ok(true),
            wire::DELETE_MISSING => Ok(false),
            other => Err(ClientError::Protocol(format!(
                "unexpected delete reply {other:#04x}"
            ))),
        }
    }

    pub fn num_keys(&self) -> Result<i64, ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        let buf = [Opcode::GetNumKeys as u8];
        wire::send(&mut *stream, &buf)
            .and_then(|_| wire::read_i64(&mut *stream))
            .map_err(|err| self.op_failed(err, self.timeout))
    }

    /// Block until every key exists, under the client's default timeout.
    pub fn wait(&self, keys: &[Vec<u8>]) -> Result<(), ClientError> {
        self.wait_timeout(keys, self.timeout)
    }

    /// Block until every key exists or `timeout` elapses. Expiry poisons
    /// the request socket: the daemon may still deliver STOP_WAITING later
    /// and there is no way to resynchronize around it.
    pub fn wait_timeout(&self, keys: &[Vec<u8>], timeout: Duration) -> Result<(), ClientError> {
        self.ensure_usable()?;
        let mut stream = self.request.lock().expect("request socket lock");
        stream
            .set_read_timeout(read_timeout(timeout))
            .map_err(ClientError::ConnectionLost)?;
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Wait as u8);
        wire::put_key_vec(&mut buf, keys);
        let result = wire::send(&mut *stream, &buf).and_then(|_| wire::read_u8(&mut *stream));
        let _ = stream.set_read_timeout(read_timeout(self.timeout));
        match result {
            Ok(wire::STOP_WAITING) => Ok(()),
            Ok(other) => Err(ClientError::Protocol(format!(
                "unexpected wait reply {other:#04x}"
            ))),
            Err(err) => Err(self.op_failed(err, timeout)),
        }
    }

    /// Subscribe to change notifications for `key`.
    ///
    /// The callback is registered before the request goes out so that a
    /// notification arriving immediately after the daemon registers us is
    /// never dropped. Blocks until the daemon acknowledges.
    pub fn watch_key(&self, key: &[u8], callback: WatchCallback) -> Result<(), ClientError> {
        self.watch
            .callbacks
            .lock()
            .expect("callbacks lock")
            .insert(key.to_vec(), callback);

        let (ack_tx, ack_rx) = channel::bounded(1);
        {
            // Push and send under the same lock so the ack queue order
            // matches the wire order of registrations.
            let mut pending = self.watch.pending_acks.lock().expect("pending acks lock");
            pending.push_back(ack_tx);
            let mut buf = Vec::new();
            wire::put_u8(&mut buf, Opcode::WatchKey as u8);
            wire::put_bytes(&mut buf, key);
            let mut writer = &self.listener_stream;
            if let Err(err) = wire::send(&mut writer, &buf) {
                pending.pop_back();
                return Err(err.into());
            }
        }

        ack_rx
            .recv_timeout(self.timeout)
            .map_err(|_| ClientError::Timeout {
                waited: self.timeout,
            })
    }

    fn ensure_usable(&self) -> Result<(), ClientError> {
        if self.poisoned.load(Ordering::Relaxed) {
            Err(ClientError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn op_failed(&self, err: WireError, waited: Duration) -> ClientError {
        if err.is_timeout() {
            self.poisoned.store(true, Ordering::Relaxed);
            ClientError::Timeout { waited }
        } else {
            err.into()
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(stream) = self.request.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Unblocks the listener thread's read so it can be joined.
        let _ = self.listener_stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.listener_thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_listener(mut stream: TcpStream, shared: Arc<WatchShared>) {
    loop {
        let notif = match wire::read_notification(&mut stream) {
            Ok(notif) => notif,
            // Daemon gone, or the owning client shut the socket down.
            Err(_) => break,
        };
        match notif.tag {
            WatchTag::Ack => {
                let pending = shared
                    .pending_acks
                    .lock()
                    .expect("pending acks lock")
                    .pop_front();
                if let Some(tx) = pending {
                    let _ = tx.send(());
                } else {
                    tracing::warn!("watch ack with no registration pending");
                }
            }
            tag => {
                let old = (tag != WatchTag::Created).then_some(notif.old);
                let new = (tag != WatchTag::Deleted).then_some(notif.new);
                let mut callbacks = shared.callbacks.lock().expect("callbacks lock");
                match callbacks.get_mut(&notif.key) {
                    Some(callback) => callback(old, new),
                    None => tracing::warn!(
                        key = %String::from_utf8_lossy(&notif.key),
                        "notification for unwatched key"
                    ),
                }
            }
        }
    }
}

fn connect_with_retry(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ClientError> {
    let deadline = Instant::now() + timeout;
    let mut delay = CONNECT_BACKOFF_BASE;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() + delay >= deadline {
                    return Err(ClientError::ConnectionLost(err));
                }
                std::thread::sleep(delay);
                delay = std::cmp::min(delay * 2, CONNECT_BACKOFF_MAX);
            }
        }
    }
}

/// `set_read_timeout` rejects a zero duration; treat it as "no timeout".
fn read_timeout(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}
