//! The dispatcher: one control thread owning the listener, the
//! pending-connect set, the fd -> connection map, and worker selection.
//!
//! Every mutation of the pool map happens here, so admission and teardown
//! edges are naturally serialized. Termination initiated elsewhere reaches
//! this thread as a `DelConn` request; termination initiated here stops the
//! connection on its worker through a synchronous call before the map is
//! touched.

use crate::config::{PoolConfig, WorkerSelection};
use crate::error::Error;
use crate::pool::conn::{Conn, ConnMode, ConnRef};
use crate::pool::interface::{DispHandle, DispRequest, WorkerHandle, WorkerRequest};
use crate::pool::tls_config::TlsContext;
use crate::pool::{PoolHandler, DEFAULT_POLL_CAPACITY, WAKE};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

// An outbound connect awaiting completion; the write-readiness (or the
// deadline) of `stream` decides its fate.
struct Pending {
    conn: ConnRef,
    stream: TcpStream,
    deadline: Instant,
}

pub(crate) struct Dispatcher {
    poll: Poll,
    receiver: Receiver<DispRequest>,
    listener: Option<TcpListener>,
    pending: HashMap<RawFd, Pending>,
    pool: HashMap<RawFd, ConnRef>,
    workers: Vec<WorkerHandle>,
    next_worker: usize,
    handler: Arc<dyn PoolHandler>,
    cfg: PoolConfig,
    tls: Option<TlsContext>,
    self_handle: DispHandle,
}

impl Dispatcher {
    pub fn new(
        poll: Poll,
        receiver: Receiver<DispRequest>,
        workers: Vec<WorkerHandle>,
        handler: Arc<dyn PoolHandler>,
        cfg: PoolConfig,
        tls: Option<TlsContext>,
        self_handle: DispHandle,
    ) -> Self {
        Self {
            poll,
            receiver,
            listener: None,
            pending: HashMap::new(),
            pool: HashMap::new(),
            workers,
            next_worker: 0,
            handler,
            cfg,
            tls,
            self_handle,
        }
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(DEFAULT_POLL_CAPACITY);
        loop {
            let timeout = self
                .pending
                .values()
                .map(|p| p.deadline)
                .min()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(err = ?e, "dispatcher poll failed");
                return;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE {
                    if self.drain_requests() {
                        self.shutdown();
                        return;
                    }
                } else if self.is_listener_token(token) {
                    self.accept_clients();
                } else {
                    self.conn_server(token.0 as RawFd, false);
                }
            }
            self.check_timeouts();
        }
    }

    fn is_listener_token(&self, token: Token) -> bool {
        self.listener
            .as_ref()
            .map(|l| l.as_raw_fd() as usize == token.0)
            .unwrap_or(false)
    }

    // Returns true when the dispatcher should shut down.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(DispRequest::Listen { addr, reply }) => {
                    let _ = reply.send(self.listen(addr));
                }
                Ok(DispRequest::Connect { addr, reply }) => {
                    let _ = reply.send(self.connect(addr));
                }
                Ok(DispRequest::Terminate { conn }) => self.disp_terminate(conn),
                Ok(DispRequest::DelConn { conn, stream }) => self.del_conn(&conn, stream),
                Ok(DispRequest::ConnReady { conn }) => {
                    let fd = conn.fd();
                    if fd >= 0 && self.pool.get(&fd).is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                        self.handler.update_conn(&conn, true);
                    }
                }
                Ok(DispRequest::Shutdown) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // listen / accept
    // ------------------------------------------------------------------

    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        // a TLS pool cannot accept without something to present
        if self.cfg.enable_tls {
            let has_identity = self
                .tls
                .as_ref()
                .map(TlsContext::has_server_identity)
                .unwrap_or(false);
            if !has_identity {
                return Err(Error::TlsServerIdentityMissing);
            }
        }

        // reset any previous listen()
        if let Some(mut old) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut old);
            info!("replacing previous listener");
        }

        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Listen)?;
        socket.set_reuse_address(true).map_err(Error::Listen)?;
        socket.set_nodelay(true).map_err(Error::Listen)?;
        socket.set_nonblocking(true).map_err(Error::Listen)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
        socket.bind(&bind_addr.into()).map_err(Error::Listen)?;
        socket
            .listen(self.cfg.max_listen_backlog as i32)
            .map_err(Error::Listen)?;

        let mut listener = TcpListener::from_std(socket.into());
        let token = Token(listener.as_raw_fd() as usize);
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .map_err(Error::Listen)?;
        let local_addr = listener.local_addr().map_err(Error::Listen)?;
        info!(addr = %local_addr, "listening for connections");
        self.listener = Some(listener);
        Ok(local_addr)
    }

    fn accept_clients(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer_addr, err = ?e, "failed to set TCP_NODELAY");
                    }
                    self.admit(stream, peer_addr, ConnMode::Passive);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(err = ?e, "transient accept error");
                    continue;
                }
                Err(e) => {
                    // fatal for this readiness round; the listener stays so a
                    // transient resource shortage does not kill the server
                    error!(err = %Error::Accept(e), "accept failed");
                    break;
                }
            }
        }
    }

    // Wires a fresh socket into the pool and hands it to a worker.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr, mode: ConnMode) {
        let fd = stream.as_raw_fd();
        let conn = Conn::new(
            fd,
            addr,
            mode,
            self.cfg.queue_capacity,
            self.cfg.recv_queue_capacity,
            self.self_handle.clone(),
        );
        self.pool.insert(fd, conn.clone());
        info!(conn = %conn, "accepted connection");
        let widx = self.select_worker();
        conn.set_worker(widx);
        self.handler.on_setup(&conn);
        self.feed(widx, conn, stream);
    }

    fn feed(&mut self, widx: usize, conn: ConnRef, stream: TcpStream) {
        self.workers[widx].add_load();
        let fed = self.workers[widx].post(WorkerRequest::Feed {
            conn: conn.clone(),
            stream,
        });
        if !fed {
            // worker is gone; tear down on this side (the stream went down
            // with the failed post, so there is nothing left to close here)
            error!(conn = %conn, worker = widx, "worker unavailable");
            conn.stop_bookkeeping();
            self.del_conn(&conn, None);
        }
    }

    // ------------------------------------------------------------------
    // connect
    // ------------------------------------------------------------------

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnRef, Error> {
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                // failed before it ever started; return a dead connection so
                // the caller observes failure uniformly
                info!(addr = %addr, err = ?e, "cannot connect to remote");
                let conn = Conn::new(
                    -1,
                    addr,
                    ConnMode::Active,
                    self.cfg.queue_capacity,
                    self.cfg.recv_queue_capacity,
                    self.self_handle.clone(),
                );
                conn.stop_bookkeeping();
                return Ok(conn);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %addr, err = ?e, "failed to set TCP_NODELAY");
        }
        let fd = stream.as_raw_fd();
        let conn = Conn::new(
            fd,
            addr,
            ConnMode::Active,
            self.cfg.queue_capacity,
            self.cfg.recv_queue_capacity,
            self.self_handle.clone(),
        );

        let mut stream = stream;
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, Token(fd as usize), Interest::WRITABLE)
        {
            info!(conn = %conn, err = ?e, "cannot watch outbound connect");
            conn.stop_bookkeeping();
            return Ok(conn);
        }

        self.pending.insert(
            fd,
            Pending {
                conn: conn.clone(),
                stream,
                deadline: Instant::now() + self.cfg.conn_server_timeout,
            },
        );
        self.pool.insert(fd, conn.clone());
        info!(conn = %conn, "created connection");
        Ok(conn)
    }

    // Completion callback for an outbound connect: write-readiness means the
    // three-way handshake finished one way or the other.
    fn conn_server(&mut self, fd: RawFd, timed_out: bool) {
        let Some(pending) = self.pending.remove(&fd) else {
            return;
        };
        let Pending {
            conn, mut stream, ..
        } = pending;
        let _ = self.poll.registry().deregister(&mut stream);

        if timed_out {
            info!(conn = %conn, "connect timeout");
            conn.stop_bookkeeping();
            self.del_conn(&conn, Some(stream));
            return;
        }
        match stream.take_error() {
            Ok(None) => {
                info!(conn = %conn, "connected to remote");
                let widx = self.select_worker();
                conn.set_worker(widx);
                self.handler.on_setup(&conn);
                self.feed(widx, conn, stream);
            }
            Ok(Some(e)) | Err(e) => {
                info!(conn = %conn, err = ?e, "connect failed");
                conn.stop_bookkeeping();
                self.del_conn(&conn, Some(stream));
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired {
            self.conn_server(fd, true);
        }
    }

    // ------------------------------------------------------------------
    // termination
    // ------------------------------------------------------------------

    // Dispatcher-side termination: stop on the owning thread, then remove.
    fn disp_terminate(&mut self, conn: ConnRef) {
        let fd = conn.fd();
        if let Some(widx) = conn.worker() {
            // ev_socket and the stream belong to the worker's loop
            let stream = self.workers[widx].stop_sync(fd);
            conn.stop_bookkeeping();
            self.del_conn(&conn, stream);
        } else {
            let stream = self.pending.remove(&fd).map(|mut p| {
                let _ = self.poll.registry().deregister(&mut p.stream);
                p.stream
            });
            conn.stop_bookkeeping();
            self.del_conn(&conn, stream);
        }
    }

    /// Removes the connection from the pool map, fires the teardown edges
    /// exactly once, and performs the single owning close of the fd by
    /// dropping the stream.
    fn del_conn(&mut self, conn: &ConnRef, stream: Option<TcpStream>) {
        let fd = conn.fd();
        if fd >= 0 && self.pool.get(&fd).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            if let Some(pinned) = self.pool.remove(&fd) {
                debug!(conn = %pinned, "tearing down connection");
                self.handler.on_teardown(&pinned);
                self.handler.update_conn(&pinned, false);
                pinned.mark_fd_closed();
            }
        }
        drop(stream);
    }

    // ------------------------------------------------------------------
    // workers / shutdown
    // ------------------------------------------------------------------

    fn select_worker(&mut self) -> usize {
        match self.cfg.worker_selection {
            WorkerSelection::RoundRobin => {
                let idx = self.next_worker;
                self.next_worker = (self.next_worker + 1) % self.workers.len();
                idx
            }
            WorkerSelection::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.load())
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        }
    }

    fn shutdown(&mut self) {
        debug!("dispatcher shutting down");
        let conns: Vec<ConnRef> = self.pool.values().cloned().collect();
        for conn in conns {
            self.disp_terminate(conn);
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        for worker in &self.workers {
            worker.post(WorkerRequest::Shutdown);
        }
    }
}
