//! Non-blocking TCP expressed as stages.
//!
//! * [`ListenService`] hosts the listen stage: it binds listeners and accepts
//!   connections.
//! * [`SocketService`] hosts the read stage and the write stage: it moves
//!   bytes for established connections and completes outgoing connects.
//! * [`SocketFactory`] is the application entry point producing listen and
//!   connect requests.
//!
//! Every live socket is owned by the [`ConnectionManager`]; selection keys only
//! hold weak references to the socket states.
use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::selector::Selector;

mod connection;
mod factory;
mod listen;
pub(crate) mod state;
mod stream;

pub use connection::{ClientSocket, IncomingPacket, Origin, ServerSocket, TcpConnection};
pub use factory::SocketFactory;
pub use listen::ListenService;
pub use stream::SocketService;

use state::{ConnectSocketState, ListenSocketState, ReadWriteSocketState};

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Tunables shared by the socket stages.
///
/// Counts set to 0 mean "no limit" where the limit is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_accepts_per_cycle")]
    pub max_accepts_per_cycle: usize,
    /// Connections served per write readiness cycle.
    #[serde(default)]
    pub max_writes_per_cycle: usize,
    /// Write attempts per request and readiness cycle.
    #[serde(default = "default_write_spin_count")]
    pub write_spin_count: usize,
    /// Consecutive idle write cycles after which write interest is dropped.
    #[serde(default = "default_write_disable_threshold")]
    pub write_disable_threshold: usize,
    #[serde(default = "default_max_write_chunk")]
    pub max_write_chunk: usize,
    /// Queued requests of one connection processed per readiness cycle.
    #[serde(default = "default_max_write_requests_per_socket")]
    pub max_write_requests_per_socket: usize,
    /// Outstanding requests beyond which a connection refuses new ones.
    #[serde(default = "default_write_clog_threshold")]
    pub write_clog_threshold: usize,
    #[serde(default = "default_read_clog_tries")]
    pub read_clog_tries: usize,
    #[serde(default = "default_connect_clog_tries")]
    pub connect_clog_tries: usize,
    /// Capacity of the OS event buffer of each selector.
    #[serde(default = "default_selector_events")]
    pub selector_events: usize,
    /// How long an idle socket stage polls its selector when the stage queue
    /// has no timeout of its own.
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
    /// Sink names under which the socket stages find each other.
    #[serde(default = "default_read_sink")]
    pub read_sink: String,
    #[serde(default = "default_write_sink")]
    pub write_sink: String,
    #[serde(default = "default_listen_sink")]
    pub listen_sink: String,
}

define_const!(default_read_buffer_size, 8192, usize);
define_const!(default_max_accepts_per_cycle, 64, usize);
define_const!(default_write_spin_count, 10, usize);
define_const!(default_write_disable_threshold, 16, usize);
define_const!(default_max_write_chunk, 16384, usize);
define_const!(default_max_write_requests_per_socket, 16, usize);
define_const!(default_write_clog_threshold, 1024, usize);
define_const!(default_read_clog_tries, 8, usize);
define_const!(default_connect_clog_tries, 16, usize);
define_const!(default_selector_events, 1024, usize);
define_const!(default_select_timeout_ms, 10, u64);

fn default_read_sink() -> String {
    "read".to_string()
}

fn default_write_sink() -> String {
    "write".to_string()
}

fn default_listen_sink() -> String {
    "listen".to_string()
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_accepts_per_cycle: default_max_accepts_per_cycle(),
            max_writes_per_cycle: 0,
            write_spin_count: default_write_spin_count(),
            write_disable_threshold: default_write_disable_threshold(),
            max_write_chunk: default_max_write_chunk(),
            max_write_requests_per_socket: default_max_write_requests_per_socket(),
            write_clog_threshold: default_write_clog_threshold(),
            read_clog_tries: default_read_clog_tries(),
            connect_clog_tries: default_connect_clog_tries(),
            selector_events: default_selector_events(),
            select_timeout_ms: default_select_timeout_ms(),
            read_sink: default_read_sink(),
            write_sink: default_write_sink(),
            listen_sink: default_listen_sink(),
        }
    }
}

/// 0 means unlimited.
#[inline]
pub(crate) fn limit(value: usize) -> Option<usize> {
    (value > 0).then_some(value)
}

impl SocketConfig {
    pub(crate) fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms.max(1))
    }

    pub(crate) fn tuning(&self) -> Tuning {
        Tuning {
            read_buffer_size: self.read_buffer_size.max(1),
            write_spin_count: self.write_spin_count.max(1),
            write_disable_threshold: limit(self.write_disable_threshold),
            max_write_chunk: self.max_write_chunk.max(1),
            max_write_requests: limit(self.max_write_requests_per_socket),
        }
    }
}

/// The per-connection part of [`SocketConfig`], resolved.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tuning {
    pub read_buffer_size: usize,
    pub write_spin_count: usize,
    pub write_disable_threshold: Option<usize>,
    pub max_write_chunk: usize,
    pub max_write_requests: Option<usize>,
}

impl Default for Tuning {
    fn default() -> Self {
        SocketConfig::default().tuning()
    }
}

/// Identifies a connection, a pending connect or a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owner of every live socket state.
#[derive(Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    selector_events: usize,
    selectors: Mutex<Vec<Arc<Selector>>>,
    connections: Mutex<HashMap<SocketId, Arc<ReadWriteSocketState>>>,
    connecting: Mutex<HashMap<SocketId, Arc<ConnectSocketState>>>,
    listeners: Mutex<HashMap<SocketId, Arc<ListenSocketState>>>,
}

impl ConnectionManager {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            selector_events: config.selector_events,
            ..Default::default()
        }
    }

    pub fn next_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Creates a selector closed together with the manager.
    pub fn create_selector(&self) -> io::Result<Arc<Selector>> {
        let selector = Arc::new(Selector::new(self.selector_events)?);
        self.selectors.lock().push(selector.clone());
        Ok(selector)
    }

    /// Open connections.
    pub fn connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn pending_connects(&self) -> usize {
        self.connecting.lock().len()
    }

    pub(crate) fn track(&self, state: Arc<ReadWriteSocketState>) {
        self.connections.lock().insert(state.id(), state);
    }

    pub(crate) fn forget(&self, id: SocketId) {
        self.connections.lock().remove(&id);
    }

    pub(crate) fn track_listener(&self, state: Arc<ListenSocketState>) {
        self.listeners.lock().insert(state.id(), state);
    }

    pub(crate) fn listener(&self, id: SocketId) -> Option<Arc<ListenSocketState>> {
        self.listeners.lock().get(&id).cloned()
    }

    pub(crate) fn forget_listener(&self, id: SocketId) {
        self.listeners.lock().remove(&id);
    }

    pub(crate) fn track_connect(&self, state: Arc<ConnectSocketState>) {
        self.connecting.lock().insert(state.id(), state);
    }

    pub(crate) fn forget_connect(&self, id: SocketId) {
        self.connecting.lock().remove(&id);
    }

    /// Closes every socket and selector.
    ///
    /// Closed connections still notify their completion sinks.
    pub fn close_all(&self) {
        let listeners: Vec<_> = self.listeners.lock().drain().map(|(_, s)| s).collect();
        for listener in listeners {
            listener.close(false);
        }
        let connecting: Vec<_> = self.connecting.lock().drain().map(|(_, s)| s).collect();
        for state in connecting {
            state.close();
        }
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        debug!("closing {} connections", connections.len());
        for state in connections {
            state.close(None);
        }
        for selector in self.selectors.lock().drain(..) {
            selector.close();
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections())
            .field("listeners", &self.listeners())
            .field("pending_connects", &self.pending_connects())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: SocketConfig = toml::from_str("read_buffer_size = 512").unwrap();
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.max_accepts_per_cycle, 64);
        assert_eq!(config.max_writes_per_cycle, 0);
        assert_eq!(config.write_sink, "write");
        assert_eq!(config.select_timeout(), Duration::from_millis(10));
        assert_eq!(config, SocketConfig {
            read_buffer_size: 512,
            ..Default::default()
        });
    }

    #[test]
    fn zero_means_unlimited() {
        let config = SocketConfig {
            write_spin_count: 0,
            write_disable_threshold: 0,
            max_write_requests_per_socket: 0,
            ..Default::default()
        };
        let tuning = config.tuning();
        assert_eq!(tuning.write_spin_count, 1);
        assert_eq!(tuning.write_disable_threshold, None);
        assert_eq!(tuning.max_write_requests, None);
        assert_eq!(limit(3), Some(3));
    }

    #[test]
    fn ids_are_unique_and_selectors_closed_with_manager() {
        let manager = ConnectionManager::new(&SocketConfig::default());
        let a = manager.next_id();
        let b = manager.next_id();
        assert_ne!(a, b);
        assert!(a.get() > 0);

        let selector = manager.create_selector().unwrap();
        manager.close_all();
        assert!(selector.is_closed());
    }
}
