//! Shared helpers for the integration tests.
//!
//! # Running with tracing
//!
//! Use the TEST_LOG environment variable to control tracing verbosity
//! (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test echo_over_plain_tcp -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test echo_over_plain_tcp -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test echo_over_plain_tcp -- --nocapture
//! ```

#![allow(dead_code)]

use netpool::{ConnRef, PoolHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize tracing based on the TEST_LOG environment variable.
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);
            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };
                let filter = format!("netpool={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// Polls `pred` every 10ms until it holds or `timeout` elapses.
pub fn poll_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[derive(Default, Clone)]
struct ConnStats {
    setup: usize,
    worker_setup: usize,
    teardown: usize,
    reads: usize,
    ups: usize,
    downs: usize,
    read_before_setup: bool,
    read_after_down: bool,
    first_read_peer_cert: Option<bool>,
}

#[derive(Default)]
struct State {
    conns: HashMap<usize, ConnStats>,
    received: Vec<u8>,
}

/// A [`PoolHandler`] that records every lifecycle edge so tests can assert
/// the ordering invariants, optionally echoing received bytes back.
pub struct Recorder {
    state: Mutex<State>,
    echo: bool,
    close_on_setup: bool,
}

impl Recorder {
    /// Collects received bytes.
    pub fn collect() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            echo: false,
            close_on_setup: false,
        })
    }

    /// Echoes received bytes back to the sender.
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            echo: true,
            close_on_setup: false,
        })
    }

    /// Terminates every connection as soon as it is admitted.
    pub fn close_on_setup() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            echo: false,
            close_on_setup: true,
        })
    }

    fn key(conn: &ConnRef) -> usize {
        Arc::as_ptr(conn) as usize
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_len(&self) -> usize {
        self.state.lock().unwrap().received.len()
    }

    pub fn teardowns(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.conns.values().map(|s| s.teardown).sum()
    }

    pub fn setups(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.conns.values().map(|s| s.setup).sum()
    }

    pub fn up_edges(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.conns.values().map(|s| s.ups).sum()
    }

    pub fn reads(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.conns.values().map(|s| s.reads).sum()
    }

    /// Whether the peer certificate was populated when the first `on_read`
    /// fired, for any connection that has read data.
    pub fn first_read_peer_cert(&self) -> Option<bool> {
        let st = self.state.lock().unwrap();
        st.conns.values().find_map(|s| s.first_read_peer_cert)
    }

    /// Panics if any recorded connection violated the lifecycle contract.
    pub fn assert_invariants(&self) {
        let st = self.state.lock().unwrap();
        for stats in st.conns.values() {
            assert!(stats.teardown <= 1, "on_teardown fired more than once");
            assert!(stats.downs <= 1, "update_conn(false) fired more than once");
            assert!(stats.ups <= 1, "update_conn(true) fired more than once");
            assert_eq!(
                stats.teardown, stats.downs,
                "teardown and the down edge must come together"
            );
            assert!(!stats.read_before_setup, "on_read fired before on_setup");
            assert!(!stats.read_after_down, "on_read fired after the down edge");
            if stats.reads > 0 {
                assert!(stats.setup > 0, "reads on a connection that was never set up");
            }
        }
    }
}

impl PoolHandler for Recorder {
    fn on_setup(&self, conn: &ConnRef) {
        let key = Self::key(conn);
        self.state.lock().unwrap().conns.entry(key).or_default().setup += 1;
        if self.close_on_setup {
            conn.terminate();
        }
    }

    fn on_worker_setup(&self, conn: &ConnRef) {
        let key = Self::key(conn);
        self.state
            .lock()
            .unwrap()
            .conns
            .entry(key)
            .or_default()
            .worker_setup += 1;
    }

    fn on_teardown(&self, conn: &ConnRef) {
        let key = Self::key(conn);
        self.state
            .lock()
            .unwrap()
            .conns
            .entry(key)
            .or_default()
            .teardown += 1;
    }

    fn on_read(&self, conn: &ConnRef) {
        let data = conn.recv_all();
        let has_cert = conn.peer_cert().is_some();
        let key = Self::key(conn);
        {
            let mut st = self.state.lock().unwrap();
            let stats = st.conns.entry(key).or_default();
            if stats.setup == 0 {
                stats.read_before_setup = true;
            }
            if stats.downs > 0 {
                stats.read_after_down = true;
            }
            if stats.reads == 0 {
                stats.first_read_peer_cert = Some(has_cert);
            }
            stats.reads += 1;
            if !self.echo {
                st.received.extend_from_slice(&data);
            }
        }
        if self.echo {
            let _ = conn.try_write(&data);
        }
    }

    fn update_conn(&self, conn: &ConnRef, added: bool) {
        let key = Self::key(conn);
        let mut st = self.state.lock().unwrap();
        let stats = st.conns.entry(key).or_default();
        if added {
            stats.ups += 1;
        } else {
            stats.downs += 1;
        }
    }
}
