//! Per-connection TLS session driving.
//!
//! Wraps one rustls connection and exposes the handshake and the data path
//! as explicit readiness outcomes, so the worker state machines can re-arm
//! the right interest instead of interpreting library internals. TLS can
//! demand socket reads to make progress on a logical write and vice versa;
//! the `WantRead`/`WantWrite` outcomes carry exactly that.

use crate::error::Error;
use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, ServerName};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

// Internal enum over the two session roles
enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, sock: &mut TcpStream) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(sock),
            TlsConnection::Client(conn) => conn.read_tls(sock),
        }
    }

    fn write_tls(&mut self, sock: &mut TcpStream) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(sock),
            TlsConnection::Client(conn) => conn.write_tls(sock),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            TlsConnection::Server(conn) => conn.peer_certificates(),
            TlsConnection::Client(conn) => conn.peer_certificates(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    /// Handshake finished; the peer certificate (if presented) is available.
    Done,
    /// Re-arm for read readiness and call again.
    WantRead,
    /// Re-arm for write readiness and call again.
    WantWrite,
}

/// Outcome of one data-path send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsIo {
    /// Bytes moved across the session.
    Progress(usize),
    /// No progress until the socket is readable.
    WantRead,
    /// No progress until the socket is writable.
    WantWrite,
    /// The peer closed the session.
    Closed,
}

enum Flushed {
    Done,
    WouldBlock,
}

/// One TLS session bound to a connection's socket.
pub(crate) struct TlsSession {
    conn: TlsConnection,
}

impl TlsSession {
    pub fn new_client(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, Error> {
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self {
            conn: TlsConnection::Client(conn),
        })
    }

    pub fn new_server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let conn =
            rustls::ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self {
            conn: TlsConnection::Server(conn),
        })
    }

    /// Advances the handshake as far as the socket allows.
    pub fn handshake(&mut self, sock: &mut TcpStream) -> Result<HandshakeStatus, Error> {
        loop {
            match self.flush(sock)? {
                Flushed::Done => {}
                Flushed::WouldBlock => return Ok(HandshakeStatus::WantWrite),
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeStatus::Done);
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Err(Error::Tls("peer closed during handshake".to_string())),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| Error::Tls(e.to_string()))?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.conn.wants_write() {
                        continue;
                    }
                    return Ok(HandshakeStatus::WantRead);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
        }
    }

    /// Encrypts `buf` and pushes as much as possible to the socket.
    ///
    /// Pending records from an earlier call are flushed first, so a blocked
    /// socket surfaces as `WantWrite` instead of unbounded session buffering.
    pub fn send(&mut self, sock: &mut TcpStream, buf: &[u8]) -> Result<TlsIo, Error> {
        match self.flush(sock)? {
            Flushed::Done => {}
            Flushed::WouldBlock => return Ok(TlsIo::WantWrite),
        }
        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(|e| Error::Tls(e.to_string()))?;
        self.flush(sock)?;
        Ok(TlsIo::Progress(n))
    }

    /// Pulls ciphertext from the socket and decrypts into `buf`.
    pub fn recv(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> Result<TlsIo, Error> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Ok(TlsIo::Closed),
                Ok(n) => return Ok(TlsIo::Progress(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(TlsIo::Closed),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| Error::Tls(e.to_string()))?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(if self.conn.wants_write() {
                        TlsIo::WantWrite
                    } else {
                        TlsIo::WantRead
                    });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
        }
    }

    /// Whether the session still has records queued for the socket.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// The certificate the peer presented during the handshake, if any.
    pub fn peer_cert(&self) -> Option<CertificateDer<'static>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.clone().into_owned())
    }

    /// Best-effort close_notify; errors are deliberately ignored.
    pub fn close(&mut self, sock: &mut TcpStream) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            if self.conn.write_tls(sock).is_err() {
                break;
            }
        }
    }

    fn flush(&mut self, sock: &mut TcpStream) -> Result<Flushed, Error> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flushed::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
        }
        Ok(Flushed::Done)
    }
}
