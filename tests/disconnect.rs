//! Disconnect safety: abruptly dying peers must not leak registry state,
//! stall other clients, or take the daemon down.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use muster::client::ClientError;
use muster::wire::{self, Opcode};
use muster::{Error, Store, StoreConfig};

fn server_config() -> StoreConfig {
    StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        is_server: true,
        num_workers: None,
        timeout_ms: 5_000,
        wait_workers: false,
    }
}

fn client_config(addr: SocketAddr) -> StoreConfig {
    StoreConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        is_server: false,
        num_workers: None,
        timeout_ms: 5_000,
        wait_workers: false,
    }
}

/// A bare request socket speaking the wire protocol directly, so the test
/// can die without the client's orderly teardown.
fn raw_conn(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("raw connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

#[test]
fn killing_a_waiter_mid_wait_does_not_stall_anyone() {
    let server = Store::open(server_config()).expect("open server store");

    // Park a raw connection in WAIT on a user-namespace key, then drop it
    // without ever reading the reply.
    {
        let mut raw = raw_conn(server.addr());
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::Wait as u8);
        wire::put_key_vec(&mut buf, &[b"/never".to_vec()]);
        wire::send(&mut raw, &buf).expect("send wait");
    }

    // The daemon keeps serving, and writing the awaited key (which may
    // still have the dead socket registered) is harmless.
    let client = Store::open(client_config(server.addr())).expect("open client store");
    client.set("never", b"v").expect("set");
    assert_eq!(client.get("never").expect("get"), b"v");
    assert_eq!(server.get("never").expect("get"), b"v");
}

#[test]
fn killing_a_watcher_does_not_break_later_mutations() {
    let server = Store::open(server_config()).expect("open server store");

    {
        let mut raw = raw_conn(server.addr());
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Opcode::WatchKey as u8);
        wire::put_bytes(&mut buf, b"/w");
        wire::send(&mut raw, &buf).expect("send watch");
        let ack = wire::read_notification(&mut raw).expect("watch ack");
        assert_eq!(ack.tag, wire::WatchTag::Ack);
    }

    // Mutations after the watcher died must go through unharmed.
    server.set("w", b"1").expect("set 1");
    server.set("w", b"2").expect("set 2");
    assert!(server.delete_key("w").expect("delete"));
    assert_eq!(server.num_keys().expect("num_keys"), 0);
}

#[test]
fn daemon_shutdown_surfaces_connection_lost_to_waiting_clients() {
    let server = Store::open(server_config()).expect("open server store");
    let addr = server.addr();

    let waiter = std::thread::spawn(move || {
        let store = Store::open(client_config(addr)).expect("open client store");
        store.wait(&["absent"])
    });

    // Give the waiter time to park, then tear the daemon down.
    std::thread::sleep(Duration::from_millis(100));
    drop(server);

    let result = waiter.join().expect("join waiter");
    let err = result.expect_err("wait must fail on shutdown");
    assert!(
        matches!(err, Error::Client(ClientError::ConnectionLost(_))),
        "expected connection lost, got: {err}"
    );
}

#[test]
fn surviving_clients_keep_working_after_a_peer_vanishes() {
    let server = Store::open(server_config()).expect("open server store");
    let survivor = Store::open(client_config(server.addr())).expect("open survivor");

    {
        let casualty = Store::open(client_config(server.addr())).expect("open casualty");
        casualty.set("shared", b"before").expect("set");
        // Dropped here: both sockets shut down, listener thread joins.
    }

    assert_eq!(survivor.get("shared").expect("get"), b"before");
    survivor.set("shared", b"after").expect("set");
    // The survivor's own read orders its SET before the server's.
    assert_eq!(survivor.get("shared").expect("get"), b"after");
    assert_eq!(server.get("shared").expect("get"), b"after");
}
