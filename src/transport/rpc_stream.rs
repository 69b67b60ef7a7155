//! RPC-over-stream transport (spec §4.E). A concrete implementation over a
//! duplex TCP byte stream, using the same `u32 LE length || BINARY Message`
//! framing as the Unix socket transport -- the two differ only in which
//! stream type they bind. TLS configuration fields (`TransportConfig` has
//! none of its own; callers wanting TLS would layer `tokio_rustls` over the
//! stream this module hands back) are intentionally not wired: no TLS crate
//! is part of this crate's dependency stack, so `enable_keepalive` aside,
//! the stream here is always plaintext. See DESIGN.md for that decision.
//!
//! Adds a keepalive task over what the Unix socket transport does: every
//! `keepalive_interval_ms` a HEARTBEAT control message is sent so a peer
//! can detect a silently-dead connection faster than its OS-level TCP
//! timeout would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    ConnectionId, ITransport, RoutingMap, TransportConfig, TransportState, TransportStats,
    TransportStatsInner, TransportType,
};
use crate::error::{TransportError, TransportResult};
use crate::message::{Message, MessageType, SerializationFormat};
use crate::serializer::{BinarySerializer, Serializer};

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

fn hex_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()
}

struct ConnectionHandle {
    writer: AsyncMutex<tokio::net::tcp::OwnedWriteHalf>,
}

struct Shared {
    serializer: BinarySerializer,
    routing: RoutingMap,
    stats: TransportStatsInner,
    connections: AsyncMutex<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    next_connection_id: AtomicU64,
    incoming_tx: AsyncMutex<Option<mpsc::Sender<Message>>>,
    multi_tx: AsyncMutex<Option<mpsc::Sender<(ConnectionId, Message)>>>,
}

impl Shared {
    async fn register_connection(&self, id: ConnectionId, handle: Arc<ConnectionHandle>) {
        self.connections.lock().await.insert(id, handle);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    async fn unregister_connection(&self, id: ConnectionId) {
        self.connections.lock().await.remove(&id);
        self.routing.remove_connection(id);
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn send_bytes_to(&self, id: ConnectionId, bytes: &[u8]) -> TransportResult<()> {
        let handle = {
            let conns = self.connections.lock().await;
            conns.get(&id).cloned().ok_or(TransportError::EndpointNotFound(id.to_string()))?
        };
        self.write_to(&handle, bytes).await
    }

    async fn write_to(&self, handle: &ConnectionHandle, bytes: &[u8]) -> TransportResult<()> {
        let mut writer = handle.writer.lock().await;
        if let Err(e) = write_frame_half(&mut writer, bytes).await {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.stats.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, id: ConnectionId, mut reader: tokio::net::tcp::OwnedReadHalf) {
        loop {
            let frame = match read_frame_half(&mut reader).await {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    warn!(connection_id = id, error = %e, "rpc stream read failed");
                    self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            self.stats.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

            let message = match self.serializer.deserialize(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!(connection_id = id, error = %e, "dropping undeserializable frame");
                    self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if message.header.msg_type == MessageType::Heartbeat {
                continue;
            }
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

            if message.header.msg_type == MessageType::Request {
                self.routing.insert(hex_id(&message.header.message_id), id);
            }

            let multi_tx = self.multi_tx.lock().await.clone();
            if let Some(tx) = multi_tx {
                let _ = tx.send((id, message)).await;
            } else if let Some(tx) = self.incoming_tx.lock().await.as_ref() {
                let _ = tx.send(message).await;
            }
        }
        self.unregister_connection(id).await;
    }

    async fn spawn_connection(self: &Arc<Self>, stream: TcpStream, keepalive_interval_ms: u32) -> ConnectionId {
        let _ = stream.set_nodelay(true);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let handle = Arc::new(ConnectionHandle { writer: AsyncMutex::new(writer) });
        self.register_connection(id, handle).await;
        tokio::spawn(Arc::clone(self).reader_loop(id, reader));
        if keepalive_interval_ms > 0 {
            tokio::spawn(Arc::clone(self).keepalive_loop(id, keepalive_interval_ms));
        }
        id
    }

    async fn keepalive_loop(self: Arc<Self>, id: ConnectionId, interval_ms: u32) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms as u64));
        loop {
            ticker.tick().await;
            let handle = {
                let conns = self.connections.lock().await;
                match conns.get(&id) {
                    Some(h) => Arc::clone(h),
                    None => break,
                }
            };
            let heartbeat = Message::new_request("__heartbeat__", "", "", Vec::new(), SerializationFormat::Binary);
            let mut heartbeat = heartbeat;
            heartbeat.header.msg_type = MessageType::Heartbeat;
            let bytes = match self.serializer.serialize(&heartbeat) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if self.write_to(&handle, &bytes).await.is_err() {
                break;
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, keepalive_interval_ms: u32) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted rpc stream connection");
                    self.spawn_connection(stream, keepalive_interval_ms).await;
                }
                Err(e) => {
                    warn!(error = %e, "rpc stream accept failed");
                    break;
                }
            }
        }
    }
}

async fn write_frame_half(writer: &mut tokio::net::tcp::OwnedWriteHalf, bytes: &[u8]) -> TransportResult<()> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::BufferOverflow);
    }
    let write_fut = async {
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn read_frame_half(reader: &mut tokio::net::tcp::OwnedReadHalf) -> TransportResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::RecvFailed(e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::ProtocolError(format!(
            "frame size {} exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
    Ok(Some(buf))
}

/// `ITransport` over a plain TCP duplex stream, standing in for "RPC over
/// an arbitrary byte stream" (spec §4.E) since a loopback TCP connection is
/// the simplest concrete stream this crate can open without extra
/// transport-layer dependencies.
pub struct RpcStreamTransport {
    config: AsyncRwLock<TransportConfig>,
    state: AsyncRwLock<TransportState>,
    connected: AtomicBool,
    shared: Arc<Shared>,
    incoming_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
}

impl RpcStreamTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        RpcStreamTransport {
            config: AsyncRwLock::new(config),
            state: AsyncRwLock::new(TransportState::Uninitialized),
            connected: AtomicBool::new(false),
            shared: Arc::new(Shared {
                serializer: BinarySerializer,
                routing: RoutingMap::new(),
                stats: TransportStatsInner::default(),
                connections: AsyncMutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                incoming_tx: AsyncMutex::new(Some(tx)),
                multi_tx: AsyncMutex::new(None),
            }),
            incoming_rx: AsyncMutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl ITransport for RpcStreamTransport {
    async fn init(&self, config: TransportConfig) -> TransportResult<()> {
        let mut state = self.state.write().await;
        if *state != TransportState::Uninitialized {
            return Err(TransportError::AlreadyInitialized);
        }
        *self.config.write().await = config;
        *state = TransportState::Initialized;
        Ok(())
    }

    async fn start(&self) -> TransportResult<()> {
        let cfg = self.config.read().await.clone();
        {
            let mut state = self.state.write().await;
            if *state != TransportState::Initialized {
                return Err(TransportError::NotInitialized);
            }
            *state = TransportState::Connecting;
        }

        if cfg.is_server {
            let addr: SocketAddr = cfg
                .endpoint
                .parse()
                .map_err(|e| TransportError::InvalidConfig(format!("invalid endpoint {}: {}", cfg.endpoint, e)))?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            let shared = Arc::clone(&self.shared);
            let keepalive_ms = if cfg.enable_keepalive { cfg.keepalive_interval_ms } else { 0 };
            tokio::spawn(async move {
                if let Ok((stream, _addr)) = listener.accept().await {
                    shared.spawn_connection(stream, keepalive_ms).await;
                } else {
                    warn!("rpc stream server failed to accept its single peer");
                }
            });
            self.connected.store(true, Ordering::Relaxed);
        }

        *self.state.write().await = if cfg.is_server {
            TransportState::Connected
        } else {
            TransportState::Initialized
        };
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        *self.state.write().await = TransportState::Disconnecting;
        self.shared.connections.lock().await.clear();
        self.connected.store(false, Ordering::Relaxed);
        *self.state.write().await = TransportState::Disconnected;
        Ok(())
    }

    async fn cleanup(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn connect(&self) -> TransportResult<()> {
        let cfg = self.config.read().await.clone();
        if cfg.is_server {
            return Ok(());
        }
        let stream = timeout(
            Duration::from_millis(cfg.connect_timeout_ms as u64),
            TcpStream::connect(&cfg.endpoint),
        )
        .await
        .map_err(|_| TransportError::ConnectionTimeout)?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let keepalive_ms = if cfg.enable_keepalive { cfg.keepalive_interval_ms } else { 0 };
        self.shared.spawn_connection(stream, keepalive_ms).await;
        self.connected.store(true, Ordering::Relaxed);
        *self.state.write().await = TransportState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.shared.connections.lock().await.clear();
        *self.state.write().await = TransportState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, message: &Message) -> TransportResult<()> {
        let bytes = self
            .shared
            .serializer
            .serialize(message)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;

        if matches!(message.header.msg_type, MessageType::Response | MessageType::Error) {
            if let Some(conn_id) = self.shared.routing.take(&hex_id(&message.header.correlation_id)) {
                return self.shared.send_bytes_to(conn_id, &bytes).await;
            }
        }

        let conns = self.shared.connections.lock().await;
        if conns.is_empty() {
            return Err(TransportError::NotConnected);
        }
        for handle in conns.values() {
            self.shared.write_to(handle, &bytes).await?;
        }
        Ok(())
    }

    async fn send_to_connection(&self, connection_id: ConnectionId, message: &Message) -> TransportResult<()> {
        let bytes = self
            .shared
            .serializer
            .serialize(message)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        self.shared.send_bytes_to(connection_id, &bytes).await
    }

    async fn receive(&self, timeout_ms: u32) -> TransportResult<Option<Message>> {
        let mut guard = self.incoming_rx.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let deadline = if timeout_ms == 0 { 100 } else { timeout_ms as u64 };
        match tokio::time::timeout(Duration::from_millis(deadline), rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    fn state(&self) -> TransportState {
        self.state.try_read().map(|g| *g).unwrap_or(TransportState::Error)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::RpcStream
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    fn supports_multiple_connections(&self) -> bool {
        true
    }

    async fn start_multi_server(&self) -> TransportResult<mpsc::Receiver<(ConnectionId, Message)>> {
        let cfg = self.config.read().await.clone();
        if !cfg.is_server {
            return Err(TransportError::InvalidConfig(
                "start_multi_server requires is_server = true".into(),
            ));
        }
        let addr: SocketAddr = cfg
            .endpoint
            .parse()
            .map_err(|e| TransportError::InvalidConfig(format!("invalid endpoint {}: {}", cfg.endpoint, e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(cfg.buffer_size.max(16) as usize);
        *self.shared.multi_tx.lock().await = Some(tx);
        *self.state.write().await = TransportState::Connected;
        self.connected.store(true, Ordering::Relaxed);

        let keepalive_ms = if cfg.enable_keepalive { cfg.keepalive_interval_ms } else { 0 };
        tokio::spawn(Arc::clone(&self.shared).accept_loop(listener, keepalive_ms));
        Ok(rx)
    }

    fn active_connections(&self) -> Vec<ConnectionId> {
        self.shared
            .connections
            .try_lock()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn close_connection(&self, connection_id: ConnectionId) -> TransportResult<()> {
        self.shared.unregister_connection(connection_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_id_matches_unix_socket_convention() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(hex_id(&id).len(), 32);
    }
}
