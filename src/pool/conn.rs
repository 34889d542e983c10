//! The per-connection object shared between the dispatcher, its owning
//! worker, and user code.
//!
//! `Conn` holds only the thread-safe part of a connection: addressing, mode,
//! the two segment queues, and the peer certificate. The socket, the TLS
//! session, and the readiness registration are confined to the owning
//! worker's table and never appear here, so no lock spans the I/O path.

use crate::error::Error;
use crate::pool::interface::{DispHandle, DispRequest};
use crate::queue::SegQueue;
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// How the connection came to be, or that it is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// Locally initiated via `connect`.
    Active,
    /// Accepted from the listener.
    Passive,
    /// Terminated; no further callbacks will fire.
    Dead,
}

impl fmt::Display for ConnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnMode::Active => write!(f, "active"),
            ConnMode::Passive => write!(f, "passive"),
            ConnMode::Dead => write!(f, "dead"),
        }
    }
}

/// Shared handle to a pooled connection.
pub type ConnRef = Arc<Conn>;

/// One TCP (optionally TLS) connection owned by a [`ConnPool`](crate::ConnPool).
pub struct Conn {
    fd: AtomicI32,
    addr: SocketAddr,
    mode: Mutex<ConnMode>,
    worker: Mutex<Option<usize>>,
    send_buffer: SegQueue,
    recv_buffer: SegQueue,
    peer_cert: Mutex<Option<CertificateDer<'static>>>,
    disp: DispHandle,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        addr: SocketAddr,
        mode: ConnMode,
        send_capacity: usize,
        recv_capacity: usize,
        disp: DispHandle,
    ) -> ConnRef {
        Arc::new(Self {
            fd: AtomicI32::new(fd),
            addr,
            mode: Mutex::new(mode),
            worker: Mutex::new(None),
            send_buffer: SegQueue::new(send_capacity),
            recv_buffer: SegQueue::new(recv_capacity),
            peer_cert: Mutex::new(None),
            disp,
        })
    }

    /// The remote endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The connection's file descriptor, or `-1` once it has been closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> ConnMode {
        *self.mode.lock().unwrap()
    }

    pub fn is_dead(&self) -> bool {
        self.mode() == ConnMode::Dead
    }

    /// The certificate the peer presented, populated at the end of the TLS
    /// handshake and before the first data callback fires.
    pub fn peer_cert(&self) -> Option<CertificateDer<'static>> {
        self.peer_cert.lock().unwrap().clone()
    }

    /// Enqueues bytes for transmission, blocking while the send queue is at
    /// capacity.
    ///
    /// The owning worker drains this queue, so blocking here from inside a
    /// worker callback can deadlock on a full queue; use [`Conn::try_write`]
    /// there instead.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.is_dead() {
            return Err(Error::ConnDead);
        }
        if !self.send_buffer.push(data.to_vec()) {
            return Err(Error::ConnDead);
        }
        Ok(())
    }

    /// Enqueues bytes without blocking. Returns `Ok(false)` when the send
    /// queue is full.
    pub fn try_write(&self, data: &[u8]) -> Result<bool, Error> {
        if self.is_dead() {
            return Err(Error::ConnDead);
        }
        match self.send_buffer.try_push(data.to_vec()) {
            Ok(()) => Ok(true),
            Err(_) if self.is_dead() => Err(Error::ConnDead),
            Err(_) => Ok(false),
        }
    }

    /// Pops the next received segment, if any.
    pub fn pop_recv(&self) -> Option<Vec<u8>> {
        self.recv_buffer.move_pop()
    }

    /// Drains every received segment into one buffer.
    pub fn recv_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(seg) = self.recv_buffer.move_pop() {
            out.extend_from_slice(&seg);
        }
        out
    }

    /// Asks the dispatcher to tear this connection down. Idempotent; safe to
    /// call from any thread, including pool callbacks.
    pub fn terminate(self: &Arc<Self>) {
        self.disp.post(DispRequest::Terminate { conn: self.clone() });
    }

    // ------------------------------------------------------------------
    // crate-internal lifecycle plumbing
    // ------------------------------------------------------------------

    pub(crate) fn set_worker(&self, idx: usize) {
        *self.worker.lock().unwrap() = Some(idx);
    }

    pub(crate) fn worker(&self) -> Option<usize> {
        *self.worker.lock().unwrap()
    }

    pub(crate) fn set_peer_cert(&self, cert: Option<CertificateDer<'static>>) {
        *self.peer_cert.lock().unwrap() = cert;
    }

    pub(crate) fn send_buffer(&self) -> &SegQueue {
        &self.send_buffer
    }

    pub(crate) fn recv_buffer(&self) -> &SegQueue {
        &self.recv_buffer
    }

    /// Transitions to `Dead`, detaches the queue handlers, and wakes any
    /// blocked writers. Returns whether this call performed the transition;
    /// later calls are no-ops.
    pub(crate) fn stop_bookkeeping(&self) -> bool {
        let mut mode = self.mode.lock().unwrap();
        if *mode == ConnMode::Dead {
            return false;
        }
        *mode = ConnMode::Dead;
        drop(mode);
        self.send_buffer.unreg_handlers();
        self.recv_buffer.unreg_handlers();
        self.send_buffer.close();
        true
    }

    /// Records that the fd has been handed back for closing.
    pub(crate) fn mark_fd_closed(&self) {
        self.fd.store(-1, Ordering::Release);
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Conn fd={} addr={} mode={}>",
            self.fd(),
            self.addr,
            self.mode()
        )
    }
}
