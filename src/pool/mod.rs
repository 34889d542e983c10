//! The connection pool: public API surface, lifecycle hooks, and thread
//! management.
//!
//! A pool runs one dispatcher thread plus `n_workers` worker threads. The
//! dispatcher owns accept, connect, and every pool-map mutation; each
//! worker owns the I/O of the connections assigned to it. [`listen`],
//! [`connect`], and [`terminate`] bounce through the dispatcher so those
//! mutations always happen on its thread.
//!
//! [`listen`]: ConnPool::listen
//! [`connect`]: ConnPool::connect
//! [`terminate`]: ConnPool::terminate

mod conn;
mod dispatcher;
mod interface;
mod tls;
mod tls_config;
mod worker;

pub use conn::{Conn, ConnMode, ConnRef};
pub use tls_config::TlsContext;

use crate::config::PoolConfig;
use crate::error::Error;
use dispatcher::Dispatcher;
use interface::{DispHandle, DispRequest};
use mio::{Poll, Token, Waker};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use worker::Worker;

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;
// Wake token for every loop; fd-based tokens can never collide with it, and
// usize::MAX itself is reserved by mio.
pub(crate) const WAKE: Token = Token(usize::MAX - 1);

/// Lifecycle hooks a pool invokes as connections come and go.
///
/// All hooks default to no-ops. `on_setup`, `on_teardown`, and
/// `update_conn` run on the dispatcher thread; `on_worker_setup` and
/// `on_read` run on the connection's owning worker thread. None of them may
/// block for long - they execute inside the event loops.
pub trait PoolHandler: Send + Sync + 'static {
    /// The connection was admitted to the pool, before it is handed to its
    /// worker.
    fn on_setup(&self, _conn: &ConnRef) {}

    /// The connection arrived on its owning worker, before any I/O fires.
    fn on_worker_setup(&self, _conn: &ConnRef) {}

    /// The connection is being torn down; fires exactly once per admitted
    /// connection.
    fn on_teardown(&self, _conn: &ConnRef) {}

    /// New bytes are available in the connection's receive queue.
    fn on_read(&self, _conn: &ConnRef) {}

    /// Admission edge bookkeeping: `added == true` once the connection is
    /// ready for traffic (after the TLS handshake on TLS pools), and
    /// `added == false` at teardown.
    fn update_conn(&self, _conn: &ConnRef, _added: bool) {}
}

/// An event-driven TCP connection pool with optional TLS.
///
/// # Example
///
/// ```no_run
/// use netpool::{ConnPool, ConnRef, PoolHandler};
/// use std::sync::Arc;
///
/// struct Echo;
///
/// impl PoolHandler for Echo {
///     fn on_read(&self, conn: &ConnRef) {
///         let data = conn.recv_all();
///         let _ = conn.try_write(&data);
///     }
/// }
///
/// # fn main() -> Result<(), netpool::Error> {
/// let config = config::Config::builder().build().unwrap();
/// let pool = ConnPool::new(&config, Arc::new(Echo))?;
/// let addr = pool.listen("0.0.0.0:20000")?;
/// println!("echoing on {addr}");
/// # Ok(())
/// # }
/// ```
pub struct ConnPool {
    disp: DispHandle,
    disp_thread: Option<JoinHandle<()>>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl ConnPool {
    /// Creates a pool from configuration, spawning the dispatcher and the
    /// worker threads.
    ///
    /// With `enable_tls` set, the TLS context is loaded from the `tls_*`
    /// configuration keys.
    pub fn new(config: &config::Config, handler: Arc<dyn PoolHandler>) -> Result<Self, Error> {
        Self::new_named(config, "", handler)
    }

    /// Creates a named pool; configuration keys are looked up as
    /// `{name}.{key}` first, then `{key}`.
    pub fn new_named(
        config: &config::Config,
        name: &str,
        handler: Arc<dyn PoolHandler>,
    ) -> Result<Self, Error> {
        let cfg = PoolConfig::from_config(config, name)?;
        let tls = if cfg.enable_tls {
            Some(TlsContext::from_config(config, name)?)
        } else {
            None
        };
        Self::build(cfg, tls, handler)
    }

    /// Creates a pool from an explicit [`PoolConfig`], bypassing the
    /// `config`-crate lookup. `tls` must be provided when
    /// `cfg.enable_tls` is set.
    pub fn with_pool_config(
        cfg: PoolConfig,
        tls: Option<TlsContext>,
        handler: Arc<dyn PoolHandler>,
    ) -> Result<Self, Error> {
        if cfg.enable_tls && tls.is_none() {
            return Err(Error::TlsContextMissing);
        }
        Self::build(cfg, tls, handler)
    }

    /// Creates a TLS pool sharing a prebuilt [`TlsContext`], e.g. one built
    /// from in-memory certificates.
    pub fn with_tls_context(
        config: &config::Config,
        name: &str,
        tls: TlsContext,
        handler: Arc<dyn PoolHandler>,
    ) -> Result<Self, Error> {
        let mut cfg = PoolConfig::from_config(config, name)?;
        cfg.enable_tls = true;
        Self::build(cfg, Some(tls), handler)
    }

    fn build(
        cfg: PoolConfig,
        tls: Option<TlsContext>,
        handler: Arc<dyn PoolHandler>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (sender, receiver) = channel();
        let disp = DispHandle::new(sender, waker);

        let mut worker_handles = Vec::with_capacity(cfg.n_workers);
        let mut worker_threads = Vec::with_capacity(cfg.n_workers);
        for id in 0..cfg.n_workers {
            let (handle, join) = Worker::spawn(
                id,
                cfg.seg_buff_size,
                tls.clone(),
                disp.clone(),
                handler.clone(),
            )?;
            worker_handles.push(handle);
            worker_threads.push(join);
        }

        let dispatcher = Dispatcher::new(
            poll,
            receiver,
            worker_handles,
            handler,
            cfg,
            tls,
            disp.clone(),
        );
        let disp_thread = std::thread::Builder::new()
            .name("netpool-dispatcher".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            disp,
            disp_thread: Some(disp_thread),
            worker_threads,
        })
    }

    /// Starts (or replaces) the listening socket at the given port and
    /// returns the bound address. Binds the wildcard address, so only the
    /// port of `addr` matters; pass port `0` for an ephemeral port.
    pub fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr, Error> {
        let addr = resolve(addr)?;
        let (tx, rx) = channel();
        if !self.disp.post(DispRequest::Listen { addr, reply: tx }) {
            return Err(Error::PoolShutdown);
        }
        rx.recv().map_err(|_| Error::PoolShutdown)?
    }

    /// Starts a nonblocking connect to `addr`.
    ///
    /// The returned connection is not ready for traffic until the
    /// [`update_conn`](PoolHandler::update_conn) admission edge fires;
    /// writes enqueued before that are delivered after admission. If the
    /// connect failed outright the returned connection is already in
    /// [`ConnMode::Dead`].
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<ConnRef, Error> {
        let addr = resolve(addr)?;
        let (tx, rx) = channel();
        if !self.disp.post(DispRequest::Connect { addr, reply: tx }) {
            return Err(Error::PoolShutdown);
        }
        rx.recv().map_err(|_| Error::PoolShutdown)?
    }

    /// Asks the dispatcher to tear a connection down. Idempotent: repeated
    /// calls, or racing against a worker-side termination, are harmless.
    pub fn terminate(&self, conn: &ConnRef) {
        self.disp.post(DispRequest::Terminate { conn: conn.clone() });
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.disp.post(DispRequest::Shutdown);
        if let Some(join) = self.disp_thread.take() {
            let _ = join.join();
        }
        for join in self.worker_threads.drain(..) {
            let _ = join.join();
        }
    }
}

fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)
}
