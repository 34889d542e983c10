//! Cross-thread calls between the dispatcher and the workers.
//!
//! Each event loop owns an mpsc receiver paired with a `mio::Waker`.
//! Posting a request is send-then-wake; a synchronous call additionally
//! blocks on a reply channel. All state changes on loop-owned data travel
//! through these requests so each piece of state is only ever touched on
//! its owning thread.

use crate::error::Error;
use crate::pool::conn::ConnRef;
use mio::net::TcpStream;
use mio::Waker;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

pub(crate) enum DispRequest {
    Listen {
        addr: SocketAddr,
        reply: Sender<Result<SocketAddr, Error>>,
    },
    Connect {
        addr: SocketAddr,
        reply: Sender<Result<ConnRef, Error>>,
    },
    /// User-requested termination; runs the dispatcher-side teardown path.
    Terminate { conn: ConnRef },
    /// Posted by a worker that already stopped the connection locally.
    /// Carries the stream so the dispatcher performs the single owning close.
    DelConn {
        conn: ConnRef,
        stream: Option<TcpStream>,
    },
    /// Admission edge: the connection is ready for user traffic (post-feed,
    /// or post-handshake on TLS pools).
    ConnReady { conn: ConnRef },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct DispHandle {
    sender: Sender<DispRequest>,
    waker: Arc<Waker>,
}

impl DispHandle {
    pub fn new(sender: Sender<DispRequest>, waker: Arc<Waker>) -> Self {
        Self { sender, waker }
    }

    /// Async call: enqueue and wake. Returns `false` when the dispatcher is
    /// gone, which callers treat as "pool is shutting down".
    pub fn post(&self, req: DispRequest) -> bool {
        if self.sender.send(req).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        true
    }
}

pub(crate) enum WorkerRequest {
    /// Hand a connection and its socket to this worker for the rest of its
    /// life.
    Feed { conn: ConnRef, stream: TcpStream },
    /// The connection's send queue went non-empty.
    NotifySend { fd: RawFd },
    /// The connection's receive queue regained space after being full.
    ResumeRecv { fd: RawFd },
    /// Synchronous stop: detach the connection from this worker's loop and
    /// hand the stream back for the dispatcher-side close.
    Stop {
        fd: RawFd,
        reply: Sender<Option<TcpStream>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    sender: Sender<WorkerRequest>,
    waker: Arc<Waker>,
    load: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn new(sender: Sender<WorkerRequest>, waker: Arc<Waker>, load: Arc<AtomicUsize>) -> Self {
        Self {
            sender,
            waker,
            load,
        }
    }

    pub fn post(&self, req: WorkerRequest) -> bool {
        if self.sender.send(req).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    /// Connections currently assigned to this worker; used by the
    /// least-loaded selection policy.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    pub fn add_load(&self) {
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    /// Sync call into the worker: stop the connection on its owning thread.
    /// Returns the stream if the worker still held it.
    pub fn stop_sync(&self, fd: RawFd) -> Option<TcpStream> {
        let (tx, rx) = channel();
        if !self.post(WorkerRequest::Stop { fd, reply: tx }) {
            return None;
        }
        rx.recv().unwrap_or(None)
    }
}
