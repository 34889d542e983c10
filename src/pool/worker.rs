//! Worker threads: one event loop per worker, each driving the I/O of the
//! connections fed to it.
//!
//! A connection is pinned to exactly one worker from feed until
//! termination. Everything the state machines touch - the socket, the TLS
//! session, the interest registration, `ready_send` - lives in this
//! worker's table and is only ever accessed on this thread. The receive
//! loop stops on a short read, on `WouldBlock`, or when the receive queue
//! is out of space; a full queue pauses read interest until the consumer
//! drains it.

use crate::pool::conn::{ConnMode, ConnRef};
use crate::pool::interface::{DispHandle, DispRequest, WorkerHandle, WorkerRequest};
use crate::pool::tls::{HandshakeStatus, TlsIo, TlsSession};
use crate::pool::tls_config::TlsContext;
use crate::pool::{PoolHandler, DEFAULT_POLL_CAPACITY, WAKE};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

// I/O strategy for one connection; swapped from TlsHandshake to TlsData
// when the handshake completes.
enum IoMode {
    Plain,
    TlsHandshake(TlsSession),
    TlsData(TlsSession),
}

struct WorkerConn {
    conn: ConnRef,
    stream: TcpStream,
    io: IoMode,
    /// Current registration; `None` while deregistered.
    interest: Option<Interest>,
    /// The last drain saturated the socket, so a fresh enqueue may send
    /// immediately instead of waiting for a write-readiness round trip.
    ready_send: bool,
    /// Read interest withdrawn because the receive queue is full.
    recv_paused: bool,
}

pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    receiver: Receiver<WorkerRequest>,
    conns: HashMap<RawFd, WorkerConn>,
    disp: DispHandle,
    handler: Arc<dyn PoolHandler>,
    tls: Option<TlsContext>,
    seg_buff_size: usize,
    load: Arc<AtomicUsize>,
    self_handle: WorkerHandle,
}

impl Worker {
    pub fn spawn(
        id: usize,
        seg_buff_size: usize,
        tls: Option<TlsContext>,
        disp: DispHandle,
        handler: Arc<dyn PoolHandler>,
    ) -> Result<(WorkerHandle, JoinHandle<()>), crate::Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE)?);
        let (sender, receiver) = channel();
        let load = Arc::new(AtomicUsize::new(0));
        let handle = WorkerHandle::new(sender, waker, load.clone());

        let worker = Worker {
            id,
            poll,
            receiver,
            conns: HashMap::new(),
            disp,
            handler,
            tls,
            seg_buff_size,
            load,
            self_handle: handle.clone(),
        };
        let join = std::thread::Builder::new()
            .name(format!("netpool-worker-{id}"))
            .spawn(move || worker.run())?;
        Ok((handle, join))
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(DEFAULT_POLL_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, err = ?e, "worker poll failed");
                return;
            }
            for event in events.iter() {
                if event.token() == WAKE {
                    if self.drain_requests() {
                        debug!(worker = self.id, "worker shutting down");
                        return;
                    }
                } else {
                    let fd = event.token().0 as RawFd;
                    self.handle_event(
                        fd,
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error(),
                    );
                }
            }
        }
    }

    // Returns true when the worker should exit.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(WorkerRequest::Feed { conn, stream }) => self.feed(conn, stream),
                Ok(WorkerRequest::NotifySend { fd }) => self.notify_send(fd),
                Ok(WorkerRequest::ResumeRecv { fd }) => self.resume_recv(fd),
                Ok(WorkerRequest::Stop { fd, reply }) => {
                    let stream = self.stop_conn(fd);
                    let _ = reply.send(stream);
                }
                Ok(WorkerRequest::Shutdown) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    fn feed(&mut self, conn: ConnRef, mut stream: TcpStream) {
        let fd = conn.fd();
        if conn.is_dead() {
            // terminated while in flight; hand the socket back for closing
            self.load.fetch_sub(1, Ordering::Relaxed);
            self.disp.post(DispRequest::DelConn {
                conn,
                stream: Some(stream),
            });
            return;
        }
        debug!(worker = self.id, conn = %conn, "connection fed to worker");

        let io = match &self.tls {
            Some(ctx) => {
                let sess = if conn.mode() == ConnMode::Passive {
                    ctx.server_config().and_then(TlsSession::new_server)
                } else {
                    TlsSession::new_client(ctx.client_config(), ctx.server_name())
                };
                match sess {
                    Ok(sess) => IoMode::TlsHandshake(sess),
                    Err(e) => {
                        error!(conn = %conn, err = %e, "failed to create TLS session");
                        conn.stop_bookkeeping();
                        self.load.fetch_sub(1, Ordering::Relaxed);
                        self.disp.post(DispRequest::DelConn {
                            conn,
                            stream: Some(stream),
                        });
                        return;
                    }
                }
            }
            None => IoMode::Plain,
        };

        self.handler.on_worker_setup(&conn);

        // wake this worker when user code enqueues data or drains a full
        // receive queue
        let handle = self.self_handle.clone();
        conn.send_buffer().reg_data_handler(Box::new(move || {
            handle.post(WorkerRequest::NotifySend { fd });
        }));
        let handle = self.self_handle.clone();
        conn.recv_buffer().reg_space_handler(Box::new(move || {
            handle.post(WorkerRequest::ResumeRecv { fd });
        }));

        let mut interest = Interest::READABLE;
        let want_write = match &io {
            IoMode::Plain => !conn.send_buffer().is_empty(),
            IoMode::TlsHandshake(sess) => sess.wants_write(),
            IoMode::TlsData(_) => false,
        };
        if want_write {
            interest |= Interest::WRITABLE;
        }
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(fd as usize), interest)
        {
            error!(conn = %conn, err = ?e, "failed to register connection");
            conn.stop_bookkeeping();
            self.load.fetch_sub(1, Ordering::Relaxed);
            self.disp.post(DispRequest::DelConn {
                conn,
                stream: Some(stream),
            });
            return;
        }

        let plain = matches!(io, IoMode::Plain);
        self.conns.insert(
            fd,
            WorkerConn {
                conn: conn.clone(),
                stream,
                io,
                interest: Some(interest),
                ready_send: false,
                recv_paused: false,
            },
        );

        if plain {
            // TLS pools post this edge when the handshake completes
            self.disp.post(DispRequest::ConnReady { conn });
        }
    }

    /// Worker-side termination: stop locally, then hand the connection and
    /// its socket to the dispatcher for the map removal and the close.
    fn worker_terminate(&mut self, fd: RawFd) {
        let Some(mut wc) = self.conns.remove(&fd) else {
            return;
        };
        wc.conn.stop_bookkeeping();
        if wc.interest.is_some() {
            let _ = self.poll.registry().deregister(&mut wc.stream);
        }
        if let IoMode::TlsData(sess) = &mut wc.io {
            sess.close(&mut wc.stream);
        }
        self.load.fetch_sub(1, Ordering::Relaxed);
        debug!(worker = self.id, conn = %wc.conn, "worker terminated connection");
        self.disp.post(DispRequest::DelConn {
            conn: wc.conn.clone(),
            stream: Some(wc.stream),
        });
    }

    // Sync-stop leg of dispatcher-side termination.
    fn stop_conn(&mut self, fd: RawFd) -> Option<TcpStream> {
        let mut wc = self.conns.remove(&fd)?;
        wc.conn.stop_bookkeeping();
        if wc.interest.is_some() {
            let _ = self.poll.registry().deregister(&mut wc.stream);
        }
        if let IoMode::TlsData(sess) = &mut wc.io {
            sess.close(&mut wc.stream);
        }
        self.load.fetch_sub(1, Ordering::Relaxed);
        Some(wc.stream)
    }

    // ------------------------------------------------------------------
    // readiness dispatch
    // ------------------------------------------------------------------

    fn handle_event(&mut self, fd: RawFd, readable: bool, writable: bool, is_error: bool) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            // removed earlier in this poll cycle
            return;
        };
        if is_error {
            let err = wc.stream.take_error().ok().flatten();
            warn!(conn = %wc.conn, err = ?err, "socket error event");
            self.worker_terminate(fd);
            return;
        }
        if matches!(wc.io, IoMode::TlsHandshake(_)) {
            self.handshake_step(fd, readable);
            return;
        }
        if readable {
            self.recv_data(fd);
        }
        if writable && self.conns.contains_key(&fd) {
            self.send_data(fd);
        }
    }

    fn notify_send(&mut self, fd: RawFd) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        if matches!(wc.io, IoMode::TlsHandshake(_)) {
            // queued data drains once the handshake completes
            return;
        }
        if wc.ready_send {
            self.send_data(fd);
        } else {
            let desired = Self::desired_interest(wc, true);
            Self::set_interest(&self.poll, wc, fd, desired);
        }
    }

    fn resume_recv(&mut self, fd: RawFd) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        if !wc.recv_paused {
            return;
        }
        wc.recv_paused = false;
        let want_write = wc
            .interest
            .map(|i| i.is_writable())
            .unwrap_or(false);
        let desired = Self::desired_interest(wc, want_write);
        Self::set_interest(&self.poll, wc, fd, desired);
        // pick up bytes that were already waiting in the socket
        self.recv_data(fd);
    }

    // ------------------------------------------------------------------
    // send state machine
    // ------------------------------------------------------------------

    fn send_data(&mut self, fd: RawFd) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        let conn = wc.conn.clone();
        let mut terminate = false;

        loop {
            let Some(seg) = conn.send_buffer().move_pop() else {
                // buffer consumed but the endpoint still seems writable
                let tls_pending = matches!(&wc.io, IoMode::TlsData(sess) if sess.wants_write());
                let desired = Self::desired_interest(wc, tls_pending);
                Self::set_interest(&self.poll, wc, fd, desired);
                wc.ready_send = !tls_pending;
                return;
            };
            let size = seg.len();
            match &mut wc.io {
                IoMode::Plain => match wc.stream.write(&seg) {
                    Ok(n) if n == size => {
                        trace!(conn = %conn, len = n, "socket sent bytes");
                    }
                    Ok(n) if n > 0 => {
                        // rewind the leftover and wait for the next write event
                        trace!(conn = %conn, len = n, "socket sent partial segment");
                        conn.send_buffer().rewind(seg[n..].to_vec());
                        wc.ready_send = false;
                        let desired = Self::desired_interest(wc, true);
                        Self::set_interest(&self.poll, wc, fd, desired);
                        return;
                    }
                    Ok(_) => {
                        warn!(conn = %conn, remaining = size, "socket write returned 0");
                        conn.send_buffer().rewind(seg);
                        wc.ready_send = false;
                        let desired = Self::desired_interest(wc, true);
                        Self::set_interest(&self.poll, wc, fd, desired);
                        return;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // nothing was sent; rewind the whole segment
                        conn.send_buffer().rewind(seg);
                        wc.ready_send = false;
                        let desired = Self::desired_interest(wc, true);
                        Self::set_interest(&self.poll, wc, fd, desired);
                        return;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {
                        conn.send_buffer().rewind(seg);
                    }
                    Err(e) => {
                        log_io_error(&conn, "send", &e);
                        terminate = true;
                    }
                },
                IoMode::TlsData(sess) => match sess.send(&mut wc.stream, &seg) {
                    Ok(TlsIo::Progress(n)) if n == size => {
                        trace!(conn = %conn, len = n, "tls sent bytes");
                    }
                    Ok(TlsIo::Progress(n)) => {
                        trace!(conn = %conn, len = n, "tls sent partial segment");
                        conn.send_buffer().rewind(seg[n..].to_vec());
                        wc.ready_send = false;
                        Self::set_interest(
                            &self.poll,
                            wc,
                            fd,
                            Some(Interest::READABLE | Interest::WRITABLE),
                        );
                        return;
                    }
                    // TLS may need the opposite readiness to make progress;
                    // keep both masks armed rather than guessing
                    Ok(TlsIo::WantWrite) | Ok(TlsIo::WantRead) => {
                        conn.send_buffer().rewind(seg);
                        wc.ready_send = false;
                        Self::set_interest(
                            &self.poll,
                            wc,
                            fd,
                            Some(Interest::READABLE | Interest::WRITABLE),
                        );
                        return;
                    }
                    Ok(TlsIo::Closed) => {
                        info!(conn = %conn, "peer closed tls session");
                        terminate = true;
                    }
                    Err(e) => {
                        warn!(conn = %conn, err = %e, "tls send failure");
                        terminate = true;
                    }
                },
                IoMode::TlsHandshake(_) => return,
            }
            if terminate {
                self.worker_terminate(fd);
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // receive state machine
    // ------------------------------------------------------------------

    fn recv_data(&mut self, fd: RawFd) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        let conn = wc.conn.clone();
        let mut got_data = false;
        let mut terminate = false;
        let mut paused = false;
        let mut tls_want_write = false;

        loop {
            if !conn.recv_buffer().has_space() {
                paused = true;
                break;
            }
            let mut seg = vec![0u8; self.seg_buff_size];
            let n = match &mut wc.io {
                IoMode::Plain => match wc.stream.read(&mut seg) {
                    Ok(0) => {
                        info!(conn = %conn, "peer closed connection");
                        terminate = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log_io_error(&conn, "recv", &e);
                        terminate = true;
                        break;
                    }
                },
                IoMode::TlsData(sess) => match sess.recv(&mut wc.stream, &mut seg) {
                    Ok(TlsIo::Progress(n)) => n,
                    Ok(TlsIo::WantRead) => break,
                    Ok(TlsIo::WantWrite) => {
                        tls_want_write = true;
                        break;
                    }
                    Ok(TlsIo::Closed) => {
                        info!(conn = %conn, "peer closed tls session");
                        terminate = true;
                        break;
                    }
                    Err(e) => {
                        warn!(conn = %conn, err = %e, "tls recv failure");
                        terminate = true;
                        break;
                    }
                },
                IoMode::TlsHandshake(_) => return,
            };
            trace!(conn = %conn, len = n, "read bytes");
            seg.truncate(n);
            if conn.recv_buffer().try_push(seg).is_err() {
                // only this worker pushes, so the space check above makes
                // this unreachable unless the queue was closed underneath us
                break;
            }
            got_data = true;
            if n < self.seg_buff_size {
                // short read; the socket is drained
                break;
            }
        }

        if terminate {
            self.worker_terminate(fd);
            return;
        }
        if got_data {
            self.handler.on_read(&conn);
        }
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        if paused && !wc.recv_paused {
            debug!(conn = %conn, "receive queue full; pausing reads");
            wc.recv_paused = true;
            let want_write = wc.interest.map(|i| i.is_writable()).unwrap_or(false);
            let desired = Self::desired_interest(wc, want_write);
            Self::set_interest(&self.poll, wc, fd, desired);
        }
        if tls_want_write {
            let desired = Self::desired_interest(wc, true);
            Self::set_interest(&self.poll, wc, fd, desired);
        }
    }

    // ------------------------------------------------------------------
    // TLS handshake
    // ------------------------------------------------------------------

    // Both readiness directions funnel here while handshaking.
    fn handshake_step(&mut self, fd: RawFd, from_read: bool) {
        let Some(wc) = self.conns.get_mut(&fd) else {
            return;
        };
        let conn = wc.conn.clone();
        if from_read {
            // handshake data arriving means the peer is responsive
            wc.ready_send = true;
        }
        let IoMode::TlsHandshake(sess) = &mut wc.io else {
            return;
        };
        match sess.handshake(&mut wc.stream) {
            Ok(HandshakeStatus::Done) => {
                let IoMode::TlsHandshake(sess) = std::mem::replace(&mut wc.io, IoMode::Plain)
                else {
                    unreachable!();
                };
                conn.set_peer_cert(sess.peer_cert());
                wc.io = IoMode::TlsData(sess);
                debug!(conn = %conn, "tls handshake completed");
                self.disp.post(DispRequest::ConnReady { conn: conn.clone() });

                let tls_pending = matches!(&wc.io, IoMode::TlsData(s) if s.wants_write());
                let want_write = tls_pending || !conn.send_buffer().is_empty();
                let desired = Self::desired_interest(wc, want_write);
                Self::set_interest(&self.poll, wc, fd, desired);

                // application data can ride the final handshake flight
                self.recv_data(fd);
                if self.conns.contains_key(&fd) && !conn.send_buffer().is_empty() {
                    self.send_data(fd);
                }
            }
            Ok(HandshakeStatus::WantRead) => {
                Self::set_interest(&self.poll, wc, fd, Some(Interest::READABLE));
            }
            Ok(HandshakeStatus::WantWrite) => {
                Self::set_interest(&self.poll, wc, fd, Some(Interest::WRITABLE));
            }
            Err(e) => {
                warn!(conn = %conn, err = %e, "tls handshake failed");
                self.worker_terminate(fd);
            }
        }
    }

    // ------------------------------------------------------------------
    // interest plumbing
    // ------------------------------------------------------------------

    fn desired_interest(wc: &WorkerConn, want_write: bool) -> Option<Interest> {
        let mut interest = if wc.recv_paused {
            None
        } else {
            Some(Interest::READABLE)
        };
        if want_write {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    fn set_interest(poll: &Poll, wc: &mut WorkerConn, fd: RawFd, interest: Option<Interest>) {
        if wc.interest == interest {
            return;
        }
        let registry = poll.registry();
        let result = match (wc.interest, interest) {
            (Some(_), Some(i)) => registry.reregister(&mut wc.stream, Token(fd as usize), i),
            (None, Some(i)) => registry.register(&mut wc.stream, Token(fd as usize), i),
            (Some(_), None) => registry.deregister(&mut wc.stream),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!(fd, err = ?e, "failed to update interest");
        }
        wc.interest = interest;
    }
}

fn log_io_error(conn: &ConnRef, op: &str, err: &std::io::Error) {
    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
            warn!(conn = %conn, op, err = ?err, "connection failure");
        }
        _ => {
            error!(conn = %conn, op, err = ?err, "socket error");
        }
    }
}
