//! The transport abstraction every IPC mechanism in this crate implements:
//! a uniform lifecycle, a uniform send/receive surface, and -- where the
//! underlying mechanism supports more than one peer -- a uniform
//! multi-client surface with per-connection routing (spec §4.C/§4.D/§4.E).

pub mod rpc_stream;
pub mod shared_memory;
pub mod unix_socket;

pub use rpc_stream::RpcStreamTransport;
pub use shared_memory::SharedMemoryTransport;
pub use unix_socket::UnixSocketTransport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};
use crate::message::Message;

/// Identifies one peer connection in a multi-client transport.
pub type ConnectionId = u64;

/// Which concrete mechanism a `TransportConfig` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    UnixSocket,
    SharedMemory,
    RpcStream,
    Unknown,
}

/// `ITransport` lifecycle state (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Uninitialized,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

/// Synchronous vs. asynchronous operation; `Sync` still runs on tokio under
/// the hood in this crate, but governs whether `receive` returns
/// immediately on an empty channel (`Async`-style polling) or blocks up to
/// a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    Sync,
    Async,
    Hybrid,
}

/// Configuration shared by every transport, plus the mechanism-specific
/// knobs named in spec §6.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub transport_type: TransportType,
    pub mode: TransportMode,
    pub endpoint: String,
    pub connect_timeout_ms: u32,
    pub send_timeout_ms: u32,
    pub recv_timeout_ms: u32,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u32,
    pub max_reconnect_attempts: u32,
    pub enable_keepalive: bool,
    pub keepalive_interval_ms: u32,
    pub max_message_size: u32,
    pub buffer_size: u32,
    pub is_server: bool,
    pub max_connections: u32,
    pub backlog: u32,
    // Shared memory specific.
    pub shm_size: usize,
    pub ring_buffer_capacity: usize,
    pub create_shm: bool,
    pub bidirectional: bool,
    pub use_semaphores: bool,
    pub semaphore_timeout_ms: u32,
    pub unlink_on_cleanup: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            transport_type: TransportType::Unknown,
            mode: TransportMode::Sync,
            endpoint: String::new(),
            connect_timeout_ms: 5_000,
            send_timeout_ms: 3_000,
            recv_timeout_ms: 3_000,
            auto_reconnect: false,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 3,
            enable_keepalive: true,
            keepalive_interval_ms: 30_000,
            max_message_size: crate::message::MAX_MESSAGE_SIZE,
            buffer_size: 65_536,
            is_server: false,
            max_connections: 16,
            backlog: 128,
            shm_size: 1024 * 1024,
            ring_buffer_capacity: 65_536,
            create_shm: false,
            bidirectional: true,
            use_semaphores: true,
            semaphore_timeout_ms: 5_000,
            unlink_on_cleanup: true,
        }
    }
}

/// Atomic counters backing `getStats`/`resetStats`.
#[derive(Debug, Default)]
pub struct TransportStatsInner {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub send_errors: AtomicU64,
    pub recv_errors: AtomicU64,
    pub connection_errors: AtomicU64,
    pub active_connections: AtomicU32,
}

/// Point-in-time snapshot of `TransportStatsInner`.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub connection_errors: u64,
    pub active_connections: u32,
}

impl TransportStatsInner {
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.send_errors.store(0, Ordering::Relaxed);
        self.recv_errors.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
    }
}

/// Uniform transport interface (spec §4.C "Contract"). Every mechanism
/// (Unix socket, shared memory, RPC stream) implements this once and the
/// proxy/stub layers above are written against it alone.
#[async_trait]
pub trait ITransport: Send + Sync {
    async fn init(&self, config: TransportConfig) -> TransportResult<()>;
    async fn start(&self) -> TransportResult<()>;
    async fn stop(&self) -> TransportResult<()>;
    async fn cleanup(&self) -> TransportResult<()>;

    async fn connect(&self) -> TransportResult<()>;
    async fn disconnect(&self) -> TransportResult<()>;
    fn is_connected(&self) -> bool;

    async fn send(&self, message: &Message) -> TransportResult<()>;
    /// `timeout_ms = 0` uses the configured default; `None` return means no
    /// message arrived before the deadline (not an error).
    async fn receive(&self, timeout_ms: u32) -> TransportResult<Option<Message>>;

    fn state(&self) -> TransportState;
    fn transport_type(&self) -> TransportType;
    fn stats(&self) -> TransportStats;
    fn reset_stats(&self);

    /// Multi-client transports route sends to a specific peer; single-peer
    /// transports (SHM point-to-point, RPC client side) may ignore
    /// `connection_id` and fall back to their single channel.
    async fn send_to_connection(&self, connection_id: ConnectionId, message: &Message) -> TransportResult<()> {
        let _ = connection_id;
        self.send(message).await
    }

    fn supports_multiple_connections(&self) -> bool {
        false
    }

    /// Starts accepting connections, handing each inbound message to the
    /// returned channel tagged with its originating connection. Default
    /// falls back to the single-connection `send`/`receive` pair fed
    /// through connection id `0`.
    async fn start_multi_server(&self) -> TransportResult<mpsc::Receiver<(ConnectionId, Message)>> {
        Err(TransportError::UnknownError(
            "this transport does not support multi-client mode".into(),
        ))
    }

    fn active_connections(&self) -> Vec<ConnectionId> {
        Vec::new()
    }

    async fn close_connection(&self, connection_id: ConnectionId) -> TransportResult<()> {
        let _ = connection_id;
        Ok(())
    }
}

pub type TransportRef = Arc<dyn ITransport>;

/// Server-side table mapping `hex(message_id)` to the connection a REQUEST
/// arrived on, so the matching RESPONSE/ERROR is routed back to the right
/// peer (spec §3 "Request-routing map", §4.C "Response routing").
#[derive(Debug, Default)]
pub struct RoutingMap {
    inner: std::sync::Mutex<HashMap<String, ConnectionId>>,
}

impl RoutingMap {
    pub fn new() -> Self {
        RoutingMap::default()
    }

    pub fn insert(&self, message_id_hex: String, connection_id: ConnectionId) {
        self.inner.lock().unwrap().insert(message_id_hex, connection_id);
    }

    pub fn take(&self, correlation_id_hex: &str) -> Option<ConnectionId> {
        self.inner.lock().unwrap().remove(correlation_id_hex)
    }

    pub fn remove_connection(&self, connection_id: ConnectionId) {
        self.inner.lock().unwrap().retain(|_, v| *v != connection_id);
    }
}

/// Constructs a transport instance for the type named in `config`.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(config: TransportConfig) -> TransportResult<TransportRef> {
        match config.transport_type {
            TransportType::UnixSocket => Ok(Arc::new(UnixSocketTransport::new(config))),
            TransportType::SharedMemory => Ok(Arc::new(SharedMemoryTransport::new(config))),
            TransportType::RpcStream => Ok(Arc::new(RpcStreamTransport::new(config))),
            TransportType::Unknown => Err(TransportError::InvalidConfig(
                "transport_type must be set".into(),
            )),
        }
    }
}
