//! Watch notifications: every mutation of a watched key reaches the
//! callback exactly once, in order, with the observed old and new values.

use std::net::SocketAddr;
use std::time::Duration;

use muster::{Store, StoreConfig};

type Event = (Option<Vec<u8>>, Option<Vec<u8>>);

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

fn recv(rx: &crossbeam::channel::Receiver<Event>) -> Event {
    rx.recv_timeout(Duration::from_secs(5)).expect("watch event")
}

#[test]
fn watcher_observes_create_update_delete() {
    let server = Store::open(server_config()).expect("open server store");
    let watcher = Store::open(client_config(server.addr())).expect("open watcher");
    let writer = Store::open(client_config(server.addr())).expect("open writer");

    let (tx, rx) = crossbeam::channel::unbounded::<Event>();
    watcher
        .watch_key(
            "k",
            Box::new(move |old, new| {
                tx.send((old, new)).expect("send event");
            }),
        )
        .expect("watch_key");

    writer.set("k", b"a").expect("set a");
    writer.set("k", b"b").expect("set b");
    assert!(writer.delete_key("k").expect("delete"));

    assert_eq!(recv(&rx), (None, Some(b"a".to_vec())));
    assert_eq!(recv(&rx), (Some(b"a".to_vec()), Some(b"b".to_vec())));
    assert_eq!(recv(&rx), (Some(b"b".to_vec()), None));

    // Exactly three events; nothing else trickles in.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn watcher_observes_add_accumulation() {
    let server = Store::open(server_config()).expect("open server store");
    let watcher = Store::open(client_config(server.addr())).expect("open watcher");

    let (tx, rx) = crossbeam::channel::unbounded::<Event>();
    watcher
        .watch_key(
            "counter",
            Box::new(move |old, new| {
                tx.send((old, new)).expect("send event");
            }),
        )
        .expect("watch_key");

    server.add("counter", 1).expect("first add");
    server.add("counter", 2).expect("second add");

    assert_eq!(recv(&rx), (None, Some(b"1".to_vec())));
    assert_eq!(recv(&rx), (Some(b"1".to_vec()), Some(b"3".to_vec())));
}

#[test]
fn unwatched_keys_stay_silent() {
    let server = Store::open(server_config()).expect("open server store");
    let watcher = Store::open(client_config(server.addr())).expect("open watcher");

    let (tx, rx) = crossbeam::channel::unbounded::<Event>();
    watcher
        .watch_key(
            "watched",
            Box::new(move |old, new| {
                tx.send((old, new)).expect("send event");
            }),
        )
        .expect("watch_key");

    server.set("other", b"x").expect("set other");
    server.set("watched", b"y").expect("set watched");

    // Only the watched key's event arrives.
    assert_eq!(recv(&rx), (None, Some(b"y".to_vec())));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn multiple_registrations_on_one_client_ack_in_order() {
    let server = Store::open(server_config()).expect("open server store");
    let watcher = Store::open(client_config(server.addr())).expect("open watcher");

    let (tx, rx) = crossbeam::channel::unbounded::<(String, Event)>();
    for key in ["a", "b", "c"] {
        let tx = tx.clone();
        watcher
            .watch_key(
                key,
                Box::new(move |old, new| {
                    tx.send((key.to_string(), (old, new))).expect("send event");
                }),
            )
            .expect("watch_key");
    }

    server.set("b", b"1").expect("set b");
    server.set("a", b"2").expect("set a");

    let first = rx.recv_timeout(Duration::from_secs(5)).expect("event");
    let second = rx.recv_timeout(Duration::from_secs(5)).expect("event");
    assert_eq!(first, ("b".to_string(), (None, Some(b"1".to_vec()))));
    assert_eq!(second, ("a".to_string(), (None, Some(b"2".to_vec()))));
}
