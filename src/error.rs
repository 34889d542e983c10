use thiserror::Error;

/// The error type for netpool operations.
///
/// Setup failures (socket creation, bind, listen, connect, TLS context
/// construction) surface synchronously through this type. I/O failures on an
/// established connection are not errors from the caller's point of view:
/// they are handled internally by terminating the connection, and the upper
/// layer learns about it through the teardown hooks.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Setting up the listening socket failed.
    #[error("Listen failed: {0}")]
    Listen(#[source] std::io::Error),

    /// Starting an outbound connection failed before it was admitted.
    #[error("Connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// Accepting an inbound connection failed.
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Attempted to write to a connection that has already been terminated.
    #[error("Connection is dead")]
    ConnDead,

    /// The pool's dispatcher thread is no longer running.
    #[error("Connection pool has shut down")]
    PoolShutdown,

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load a certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// The private key is password-protected, which this stack does not
    /// decrypt. Decrypt the key before handing it to the pool.
    #[error("Private key is encrypted - provide it in unencrypted form")]
    TlsEncryptedKey,

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// A TLS operation was requested but the pool has no TLS context.
    ///
    /// When `enable_tls` is set you must provide `tls_ca_cert` (and
    /// `tls_cert`/`tls_key` for pools that accept connections) or construct
    /// the pool with an explicit [`TlsContext`](crate::TlsContext).
    #[error("TLS context not provided - required when enable_tls is set")]
    TlsContextMissing,

    /// The pool's TLS context has no server-side identity, so it cannot
    /// accept TLS connections.
    #[error("TLS context has no certificate/key - required for listen()")]
    TlsServerIdentityMissing,

    /// Failed to build the TLS configuration from the provided settings.
    #[error("Failed to build TLS config: {0}")]
    TlsConfigBuild(String),

    /// Fatal TLS protocol failure on an individual session.
    #[error("TLS failure: {0}")]
    Tls(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `worker_selection` configuration key.
    #[error("Invalid worker selection policy '{got}', expected one of: round_robin, least_loaded")]
    InvalidWorkerSelection { got: String },
}
