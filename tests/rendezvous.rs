//! Worker rendezvous: nobody proceeds until everyone has joined.

use std::net::SocketAddr;
use std::time::Duration;

use muster::client::Client;
use muster::{Store, StoreConfig};

fn worker_config(addr: SocketAddr, num_workers: usize, wait_workers: bool) -> StoreConfig {
    StoreConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        is_server: false,
        num_workers: Some(num_workers),
        timeout_ms: 5_000,
        wait_workers,
    }
}

#[test]
fn four_workers_rendezvous() {
    // The server store opens without blocking so the test can learn the
    // ephemeral port; it joins the rendezvous explicitly below.
    let server = Store::open(StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        is_server: true,
        num_workers: Some(4),
        timeout_ms: 5_000,
        wait_workers: false,
    })
    .expect("open server store");
    let addr = server.addr();

    let (tx, rx) = crossbeam::channel::unbounded();
    let mut handles = Vec::new();
    for worker in 0..3 {
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || {
            // Blocks inside open until all four have joined.
            let store =
                Store::open(worker_config(addr, 4, true)).expect("open worker store");
            tx.send(worker).expect("send join");
            store
        }));
    }
    drop(tx);

    // Only three of four have joined; every constructor must still be
    // blocked.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    server.wait_for_workers().expect("server joins rendezvous");

    let joined: Vec<usize> = rx.iter().collect();
    assert_eq!(joined.len(), 3);
    for handle in handles {
        handle.join().expect("join worker");
    }

    // The join counter saw all four participants. The counter key lives
    // outside the user-key namespace, so inspect it with a raw client.
    let raw = Client::connect(addr, Duration::from_secs(5)).expect("raw client");
    assert_eq!(raw.get(b"init/").expect("read join counter"), b"4");
}

#[test]
fn rendezvous_is_skipped_without_a_worker_count() {
    let server = Store::open(StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        is_server: true,
        num_workers: None,
        timeout_ms: 5_000,
        wait_workers: true,
    })
    .expect("open server store");

    // No counter was ever created.
    assert_eq!(server.num_keys().expect("num_keys"), 0);
    server.wait_for_workers().expect("no-op rendezvous");
    assert_eq!(server.num_keys().expect("num_keys"), 0);
}

#[test]
fn rendezvous_times_out_when_workers_are_missing() {
    let server = Store::open(StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        is_server: true,
        num_workers: Some(2),
        timeout_ms: 200,
        wait_workers: false,
    })
    .expect("open server store");

    let err = server
        .wait_for_workers()
        .expect_err("rendezvous must time out");
    assert!(err.is_timeout(), "expected timeout, got: {err}");
}
