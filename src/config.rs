use crate::error::Error;
use ::config::Config;
use std::time::Duration;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

/// Policy for assigning a freshly admitted connection to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSelection {
    /// Rotate through the workers in order.
    RoundRobin,
    /// Pick the worker currently driving the fewest connections.
    LeastLoaded,
}

/// Pool-wide settings, read once at construction.
///
/// All keys support instance namespacing: `{name}.{key}` is tried first,
/// then the bare `{key}`, then the built-in default.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of each connection's send queue, in segments.
    pub queue_capacity: usize,
    /// Capacity of each connection's receive queue, in segments.
    pub recv_queue_capacity: usize,
    /// Maximum bytes moved per socket read, and the size of one segment.
    pub seg_buff_size: usize,
    /// Backlog passed to `listen(2)`.
    pub max_listen_backlog: u32,
    /// Deadline for an outbound connect to complete.
    pub conn_server_timeout: Duration,
    /// Number of worker threads driving connection I/O.
    pub n_workers: usize,
    /// How connections are spread over the workers.
    pub worker_selection: WorkerSelection,
    /// Whether connections run TLS on top of TCP.
    pub enable_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65536,
            recv_queue_capacity: 65536,
            seg_buff_size: 4096,
            max_listen_backlog: 10,
            conn_server_timeout: Duration::from_millis(2000),
            n_workers: 1,
            worker_selection: WorkerSelection::RoundRobin,
            enable_tls: false,
        }
    }
}

impl PoolConfig {
    /// Reads the pool settings from a [`Config`] with `{name}.{key}`
    /// namespacing, falling back to defaults for missing keys.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let worker_selection = match get_namespaced_string(config, name, "worker_selection") {
            Ok(s) => match s.as_str() {
                "round_robin" => WorkerSelection::RoundRobin,
                "least_loaded" => WorkerSelection::LeastLoaded,
                _ => return Err(Error::InvalidWorkerSelection { got: s }),
            },
            Err(_) => defaults.worker_selection,
        };

        Ok(Self {
            queue_capacity: get_namespaced_usize(config, name, "queue_capacity")
                .unwrap_or(defaults.queue_capacity),
            recv_queue_capacity: get_namespaced_usize(config, name, "recv_queue_capacity")
                .unwrap_or(defaults.recv_queue_capacity),
            seg_buff_size: get_namespaced_usize(config, name, "seg_buff_size")
                .unwrap_or(defaults.seg_buff_size)
                .max(1),
            max_listen_backlog: get_namespaced_usize(config, name, "max_listen_backlog")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_listen_backlog),
            conn_server_timeout: get_namespaced_u64(config, name, "conn_server_timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.conn_server_timeout),
            n_workers: get_namespaced_usize(config, name, "n_workers")
                .unwrap_or(defaults.n_workers)
                .max(1),
            worker_selection,
            enable_tls: get_namespaced_bool(config, name, "enable_tls")
                .unwrap_or(defaults.enable_tls),
        })
    }
}
