//! A low-level, event-driven TCP connection pool with optional TLS, built
//! on [mio](https://docs.rs/mio) readiness events and
//! [rustls](https://docs.rs/rustls).
//!
//! - **Dispatcher/worker split:** one control thread owns accept, connect,
//!   and the connection map; a configurable set of worker threads drives
//!   per-connection nonblocking I/O. Every connection is pinned to exactly
//!   one worker for its whole life.
//! - **Nonblocking state machines:** partial sends rewind to the head of
//!   the send queue, short reads end a receive round, and would-block is
//!   the normal exit everywhere - callbacks never block the loops.
//! - **Optional TLS:** the handshake runs as its own callback phase;
//!   want-read/want-write outcomes re-arm the right readiness mask, and the
//!   peer certificate is available before the first data callback.
//! - **Hook-based upper layer:** implement [`PoolHandler`] to observe
//!   setup, teardown, admission edges, and incoming bytes.
//!
//! # Quick Start
//!
//! ```no_run
//! use netpool::{ConnPool, ConnRef, PoolHandler};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl PoolHandler for Printer {
//!     fn on_read(&self, conn: &ConnRef) {
//!         let data = conn.recv_all();
//!         println!("{}: {} bytes", conn.addr(), data.len());
//!     }
//!     fn update_conn(&self, conn: &ConnRef, added: bool) {
//!         println!("{conn} {}", if added { "up" } else { "down" });
//!     }
//! }
//!
//! # fn main() -> Result<(), netpool::Error> {
//! let config = config::Config::builder()
//!     .set_default("n_workers", 2)?
//!     .build()
//!     .unwrap();
//! let pool = ConnPool::new(&config, Arc::new(Printer))?;
//! pool.listen("0.0.0.0:20000")?;
//! let conn = pool.connect("127.0.0.1:20000")?;
//! conn.write(b"hello, world\n")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Pools are configured through the [`config`](https://docs.rs/config/)
//! crate. Every key supports instance namespacing: `{name}.{key}` is tried
//! before the bare `{key}`.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | `queue_capacity` | 65536 | Send queue capacity, in segments |
//! | `recv_queue_capacity` | 65536 | Receive queue capacity, in segments |
//! | `seg_buff_size` | 4096 | Segment size and per-read byte cap |
//! | `max_listen_backlog` | 10 | Backlog passed to `listen(2)` |
//! | `conn_server_timeout_ms` | 2000 | Outbound connect deadline |
//! | `n_workers` | 1 | Worker threads |
//! | `worker_selection` | `round_robin` | `round_robin` or `least_loaded` |
//! | `enable_tls` | false | Run TLS on every connection |
//! | `tls_ca_cert` | - | CA bundle verifying peers (required for TLS) |
//! | `tls_cert` / `tls_key` | - | Local identity (required to accept TLS) |
//! | `tls_require_client_auth` | false | Demand client certificates |
//! | `tls_server_name` | `localhost` | SNI name for outbound sessions |

pub(crate) mod config;
pub mod crypto;
pub(crate) mod error;
pub(crate) mod queue;
pub mod pool;

pub use config::{PoolConfig, WorkerSelection};
pub use error::Error;
pub use pool::{Conn, ConnMode, ConnPool, ConnRef, PoolHandler, TlsContext};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::{PoolConfig, WorkerSelection};
    pub use crate::error::Error;
    pub use crate::pool::{Conn, ConnMode, ConnPool, ConnRef, PoolHandler, TlsContext};
}
