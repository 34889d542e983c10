//! TLS handshake tests: mutual-auth success with peer-certificate identity,
//! and handshake failure when the client cannot present a certificate.

mod support;

use netpool::crypto::Certificate;
use netpool::ConnPool;
use std::time::Duration;
use support::{init_tracing, poll_until, Recorder};
use tls_test_helper::{tls_client_only_config, tls_config, TlsFixture};

#[test]
fn tls_handshake_and_echo_with_mutual_auth() {
    init_tracing();

    // one self-signed identity shared by both sides: each trusts the
    // other's certificate because it is its own
    let identity = TlsFixture::generate();
    let config = tls_config(&identity, &identity, true);

    let server_rec = Recorder::echo();
    let server = ConnPool::new(&config, server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    let client_rec = Recorder::collect();
    let client = ConnPool::new(&config, client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();
    conn.write(b"ping").unwrap();

    // both sides observe the admission edge only after the handshake
    assert!(
        poll_until(Duration::from_secs(5), || {
            client_rec.up_edges() == 1 && server_rec.up_edges() == 1
        }),
        "handshake did not complete on both sides"
    );

    assert!(
        poll_until(Duration::from_secs(5), || client_rec.received_len() >= 4),
        "echo did not arrive over TLS"
    );
    assert_eq!(client_rec.received(), b"ping");

    // the client sees the server certificate, and its public key matches
    // the configured identity
    let peer = conn.peer_cert().expect("peer certificate missing");
    let peer_pubkey = Certificate::from_der(peer.as_ref())
        .unwrap()
        .public_key_der()
        .unwrap();
    let configured_pubkey = Certificate::from_pem_file(identity.cert_path())
        .unwrap()
        .public_key_der()
        .unwrap();
    assert_eq!(peer_pubkey, configured_pubkey);

    // mutual auth: the server had the client certificate before on_read
    assert_eq!(server_rec.first_read_peer_cert(), Some(true));
    assert_eq!(client_rec.first_read_peer_cert(), Some(true));

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn tls_handshake_fails_without_client_certificate() {
    init_tracing();

    let server_identity = TlsFixture::generate();
    let server_config = tls_config(&server_identity, &server_identity, true);

    let server_rec = Recorder::echo();
    let server = ConnPool::new(&server_config, server_rec.clone()).unwrap();
    let addr = server.listen("127.0.0.1:0").unwrap();

    // the client trusts the server but has no certificate to present
    let client_config = tls_client_only_config(&server_identity);
    let client_rec = Recorder::collect();
    let client = ConnPool::new(&client_config, client_rec.clone()).unwrap();
    let conn = client.connect(("127.0.0.1", addr.port())).unwrap();

    assert!(
        poll_until(Duration::from_secs(5), || {
            client_rec.teardowns() == 1 && server_rec.teardowns() == 1
        }),
        "both ends should tear down after the failed handshake"
    );
    assert!(poll_until(Duration::from_secs(1), || conn.is_dead()));

    // no data callbacks and no admission edges fired anywhere
    assert_eq!(client_rec.reads(), 0);
    assert_eq!(server_rec.reads(), 0);
    assert_eq!(client_rec.up_edges(), 0);
    assert_eq!(server_rec.up_edges(), 0);

    client_rec.assert_invariants();
    server_rec.assert_invariants();
}

#[test]
fn listen_requires_a_server_identity() {
    init_tracing();

    let ca = TlsFixture::generate();
    let config = tls_client_only_config(&ca);
    let rec = Recorder::collect();
    let pool = ConnPool::new(&config, rec).unwrap();
    assert!(pool.listen("127.0.0.1:0").is_err());
}
