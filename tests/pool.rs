//! Plain-TCP lifecycle and data-path tests: echo round trip, backpressure
//! ordering, peer reset, connect timeout, and termination idempotence.

mod support;

use netpool::{ConnMode, ConnPool};
use std::time::Duration;
use support::{init_tracing, poll_until, Recorder};

fn plain_config() -> config::Config {
    config::Config::builder().build().unwrap()
}

#[test]
fn echo_over_plain_tcp() {
    init_tracing();

    let server_rec = Recorder::echo();
    let server = ConnPool::new(&plain_config(), server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    let client_rec = Recorder::collect();
    let client = ConnPool::new(&plain_config(), client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();
    conn.write(b"hello, world\n").unwrap();

    assert!(
        poll_until(Duration::from_secs(5), || client_rec.received_len() >= 13),
        "echo did not arrive"
    );
    assert_eq!(client_rec.received(), b"hello, world\n");

    // admission edges fired on both sides
    assert!(poll_until(Duration::from_secs(1), || {
        client_rec.up_edges() == 1 && server_rec.up_edges() == 1
    }));

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn partial_send_under_backpressure_keeps_order() {
    init_tracing();

    let server_rec = Recorder::collect();
    let server = ConnPool::new(&plain_config(), server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    // a tiny send queue so the writer outruns the drain
    let client_config = config::Config::builder()
        .set_default("queue_capacity", 4)
        .unwrap()
        .set_default("seg_buff_size", 1024)
        .unwrap()
        .build()
        .unwrap();
    let client_rec = Recorder::collect();
    let client = ConnPool::new(&client_config, client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();

    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(1024) {
        // blocks whenever the queue is at capacity; nothing may be lost
        conn.write(chunk).unwrap();
    }

    assert!(
        poll_until(Duration::from_secs(10), || {
            server_rec.received_len() >= payload.len()
        }),
        "payload did not fully arrive"
    );
    assert_eq!(server_rec.received(), payload);

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn peer_reset_tears_down_the_client_side() {
    init_tracing();

    // the server drops every connection as soon as it is admitted
    let server_rec = Recorder::close_on_setup();
    let server = ConnPool::new(&plain_config(), server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    let client_rec = Recorder::collect();
    let client = ConnPool::new(&plain_config(), client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();

    assert!(
        poll_until(Duration::from_secs(5), || client_rec.teardowns() == 1),
        "client teardown did not fire"
    );
    assert!(poll_until(Duration::from_secs(1), || conn.is_dead()));
    assert!(poll_until(Duration::from_secs(1), || conn.fd() == -1));
    assert_eq!(client_rec.reads(), 0);

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn connect_timeout_terminates_the_connection() {
    init_tracing();

    let config = config::Config::builder()
        .set_default("conn_server_timeout_ms", 200)
        .unwrap()
        .build()
        .unwrap();
    let rec = Recorder::collect();
    let pool = ConnPool::new(&config, rec.clone()).unwrap();

    // TEST-NET-3, should be black-holed; if the network stack rejects the
    // connect outright the connection comes back dead immediately, which is
    // the same observable outcome
    let conn = pool.connect("203.0.113.1:81").unwrap();
    if !conn.is_dead() {
        assert!(
            poll_until(Duration::from_secs(2), || rec.teardowns() == 1),
            "teardown did not fire after the connect deadline"
        );
    }
    assert!(poll_until(Duration::from_secs(1), || conn.is_dead()));
    assert_eq!(conn.mode(), ConnMode::Dead);
    assert_eq!(rec.reads(), 0);

    rec.assert_invariants();
}

#[test]
fn terminate_is_idempotent() {
    init_tracing();

    let server_rec = Recorder::echo();
    let server = ConnPool::new(&plain_config(), server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    let client_rec = Recorder::collect();
    let client = ConnPool::new(&plain_config(), client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();

    assert!(poll_until(Duration::from_secs(5), || {
        client_rec.up_edges() == 1
    }));

    client.terminate(&conn);
    client.terminate(&conn);
    conn.terminate();

    assert!(
        poll_until(Duration::from_secs(5), || client_rec.teardowns() == 1),
        "teardown did not fire"
    );
    assert!(poll_until(Duration::from_secs(1), || conn.fd() == -1));

    // a later terminate of an already-dead connection stays a no-op
    client.terminate(&conn);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client_rec.teardowns(), 1);

    // writes to a dead connection fail cleanly
    assert!(conn.write(b"late").is_err());

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn multiple_workers_carry_multiple_connections() {
    init_tracing();

    let server_config = config::Config::builder()
        .set_default("n_workers", 3)
        .unwrap()
        .set_default("worker_selection", "least_loaded")
        .unwrap()
        .build()
        .unwrap();
    let server_rec = Recorder::echo();
    let server = ConnPool::new(&server_config, server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    let client_rec = Recorder::collect();
    let client = ConnPool::new(&plain_config(), client_rec.clone()).unwrap();

    let conns: Vec<_> = (0..6)
        .map(|_| client.connect(("127.0.0.1", addr.port())).unwrap())
        .collect();
    for (i, conn) in conns.iter().enumerate() {
        conn.write(format!("conn-{i}").as_bytes()).unwrap();
    }

    let expected: usize = (0..6).map(|i| format!("conn-{i}").len()).sum();
    assert!(
        poll_until(Duration::from_secs(5), || {
            client_rec.received_len() >= expected
        }),
        "echoes did not all arrive"
    );
    assert_eq!(server_rec.setups(), 6);

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}
