//! POSIX shared-memory transport (spec §4.D). One named segment holds a
//! `ShmControlBlock` header followed immediately by two ring-buffer data
//! regions -- owner-to-client and client-to-owner -- so traffic in either
//! direction proceeds without blocking the other direction's ring.
//!
//! POSIX named semaphores (`libc::sem_*`) wake a blocked reader instead of
//! the busy-poll-with-`sleep` loop the reference ring buffer used; the
//! `use_semaphores` config flag (spec §6) falls back to a short poll when
//! semaphores are unavailable or disabled.
//!
//! Multi-client mode (SPEC_FULL.md §4.D ADDED) pre-creates one segment per
//! connection slot, named `<base>_<connection_id>`, since a single ring
//! pair cannot fairly interleave many peers the way a socket's kernel
//! buffer can.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use shared_memory::{Shmem, ShmemConf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, warn};

use super::{
    ConnectionId, ITransport, TransportConfig, TransportState, TransportStats, TransportStatsInner,
    TransportType,
};
use crate::crc32::crc32;
use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::serializer::{BinarySerializer, Serializer};

const MAGIC: u32 = 0xCDAF_5000;
const SHM_VERSION: u32 = 1;

#[repr(C)]
struct RingMeta {
    capacity: AtomicUsize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

impl RingMeta {
    fn init(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
    }

    fn mask(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) - 1
    }

    fn available_write_space(&self) -> usize {
        let cap = self.capacity.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Relaxed);
        cap - (write - read)
    }

    fn available_read_data(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);
        write - read
    }
}

/// Fixed-layout header placed at the start of the shared segment. Data for
/// `owner_to_client` immediately follows this header; `client_to_owner`'s
/// data follows that (see `ShmControlBlock::data_offsets`).
#[repr(C)]
struct ShmControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    owner_ready: AtomicBool,
    client_ready: AtomicBool,
    shutdown: AtomicBool,
    owner_to_client: RingMeta,
    client_to_owner: RingMeta,
}

impl ShmControlBlock {
    const HEADER_SIZE: usize = std::mem::size_of::<Self>();

    unsafe fn init(ptr: *mut Self, ring_capacity: usize) {
        (*ptr).magic.store(MAGIC, Ordering::Relaxed);
        (*ptr).version.store(SHM_VERSION, Ordering::Relaxed);
        (*ptr).owner_ready.store(false, Ordering::Relaxed);
        (*ptr).client_ready.store(false, Ordering::Relaxed);
        (*ptr).shutdown.store(false, Ordering::Relaxed);
        (*ptr).owner_to_client.init(ring_capacity);
        (*ptr).client_to_owner.init(ring_capacity);
    }

    fn data_offsets(ring_capacity: usize) -> (usize, usize) {
        (Self::HEADER_SIZE, Self::HEADER_SIZE + ring_capacity)
    }
}

unsafe fn ring_write(meta: &RingMeta, data_ptr: *mut u8, bytes: &[u8]) -> TransportResult<()> {
    let needed = 4 + bytes.len();
    if meta.available_write_space() < needed {
        return Err(TransportError::BufferOverflow);
    }
    let mask = meta.mask();
    let write = meta.write_pos.load(Ordering::Relaxed);
    for (i, b) in (bytes.len() as u32).to_le_bytes().iter().enumerate() {
        *data_ptr.add((write + i) & mask) = *b;
    }
    for (i, b) in bytes.iter().enumerate() {
        *data_ptr.add((write + 4 + i) & mask) = *b;
    }
    // Cursors run free (never reduced mod capacity); only the data-pointer
    // index is masked. Reducing the stored cursor itself reintroduces the
    // wrap hazard `available_read_data`/`available_write_space` warn about.
    meta.write_pos.store(write + needed, Ordering::Release);
    Ok(())
}

unsafe fn ring_read(meta: &RingMeta, data_ptr: *mut u8) -> TransportResult<Option<Vec<u8>>> {
    if meta.available_read_data() < 4 {
        return Ok(None);
    }
    let cap = meta.capacity.load(Ordering::Relaxed);
    let mask = meta.mask();
    let read = meta.read_pos.load(Ordering::Relaxed);
    let mut len_bytes = [0u8; 4];
    for (i, b) in len_bytes.iter_mut().enumerate() {
        *b = *data_ptr.add((read + i) & mask);
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > cap {
        return Err(TransportError::ProtocolError(format!("corrupt ring frame length {}", len)));
    }
    if meta.available_read_data() < 4 + len {
        return Ok(None);
    }
    let mut out = vec![0u8; len];
    for (i, b) in out.iter_mut().enumerate() {
        *b = *data_ptr.add((read + 4 + i) & mask);
    }
    meta.read_pos.store(read + 4 + len, Ordering::Release);
    Ok(Some(out))
}

/// `{ size: u32, timestamp_us: u64, crc32: u32 }` followed by the payload
/// (spec §4.D envelope). The ring's own 4-byte frame prefix covers the
/// envelope as a whole; `size` inside the envelope covers just the payload,
/// letting a reader validate integrity before touching the serializer.
fn make_envelope(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let now_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    buf.extend_from_slice(&now_us.to_le_bytes());
    buf.extend_from_slice(&crc32(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn parse_envelope(bytes: &[u8]) -> TransportResult<Vec<u8>> {
    if bytes.len() < 16 {
        return Err(TransportError::ProtocolError("truncated shared memory envelope".into()));
    }
    let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    if bytes.len() < 16 + size {
        return Err(TransportError::ProtocolError("shared memory envelope size mismatch".into()));
    }
    let payload = &bytes[16..16 + size];
    if crc32(payload) != checksum {
        return Err(TransportError::ProtocolError("shared memory envelope checksum mismatch".into()));
    }
    Ok(payload.to_vec())
}

/// A named POSIX semaphore. The creator (`create`) owns it and unlinks it
/// on drop; a peer that only `open`s it leaves the kernel object alone.
struct NamedSemaphore {
    handle: *mut libc::sem_t,
    name: CString,
    owns: bool,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn create(name: &str) -> TransportResult<Self> {
        let c_name = CString::new(name).map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        let handle = unsafe {
            libc::sem_unlink(c_name.as_ptr());
            libc::sem_open(c_name.as_ptr(), libc::O_CREAT | libc::O_EXCL, 0o600u32, 0u32)
        };
        if handle as isize == -1 {
            return Err(TransportError::ResourceExhausted(format!(
                "sem_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(NamedSemaphore { handle, name: c_name, owns: true })
    }

    fn open(name: &str) -> TransportResult<Self> {
        let c_name = CString::new(name).map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        let handle = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if handle as isize == -1 {
            return Err(TransportError::ConnectionFailed(format!(
                "sem_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(NamedSemaphore { handle, name: c_name, owns: false })
    }

    fn post(&self) {
        unsafe {
            libc::sem_post(self.handle);
        }
    }

    /// Blocks the calling (blocking-pool) thread until posted or `timeout_ms`
    /// elapses. Must never be called directly on a tokio worker thread.
    fn wait_timeout(&self, timeout_ms: u32) -> bool {
        let deadline = SystemTime::now() + Duration::from_millis(timeout_ms as u64);
        let dur = deadline.duration_since(UNIX_EPOCH).unwrap_or_default();
        let ts = libc::timespec {
            tv_sec: dur.as_secs() as libc::time_t,
            tv_nsec: dur.subsec_nanos() as i64,
        };
        unsafe { libc::sem_timedwait(self.handle, &ts) == 0 }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.handle);
            if self.owns {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

enum Role {
    Owner,
    Client,
}

/// One shared-memory segment plus the two semaphores that guard it.
struct ShmChannel {
    _shmem: Shmem,
    control: *mut ShmControlBlock,
    owner_to_client_data: *mut u8,
    client_to_owner_data: *mut u8,
    role: Role,
    o2c_sem: Arc<NamedSemaphore>,
    c2o_sem: Arc<NamedSemaphore>,
    use_semaphores: bool,
}

unsafe impl Send for ShmChannel {}
unsafe impl Sync for ShmChannel {}

impl ShmChannel {
    fn create(segment_name: &str, ring_capacity: usize, use_semaphores: bool) -> TransportResult<Self> {
        if !ring_capacity.is_power_of_two() {
            return Err(TransportError::InvalidConfig(format!(
                "ring_buffer_capacity must be a power of two, got {}",
                ring_capacity
            )));
        }
        let total = ShmControlBlock::HEADER_SIZE + ring_capacity * 2;
        let shmem = ShmemConf::new()
            .size(total)
            .os_id(segment_name)
            .create()
            .map_err(|e| TransportError::ResourceExhausted(e.to_string()))?;
        let control = shmem.as_ptr() as *mut ShmControlBlock;
        unsafe { ShmControlBlock::init(control, ring_capacity) };
        let o2c_sem = Arc::new(NamedSemaphore::create(&format!("/{}_o2c", segment_name))?);
        let c2o_sem = Arc::new(NamedSemaphore::create(&format!("/{}_c2o", segment_name))?);
        let (o2c_off, c2o_off) = ShmControlBlock::data_offsets(ring_capacity);
        let base = shmem.as_ptr();
        unsafe {
            (*control).owner_ready.store(true, Ordering::Release);
        }
        Ok(ShmChannel {
            _shmem: shmem,
            control,
            owner_to_client_data: unsafe { base.add(o2c_off) },
            client_to_owner_data: unsafe { base.add(c2o_off) },
            role: Role::Owner,
            o2c_sem,
            c2o_sem,
            use_semaphores,
        })
    }

    fn open(segment_name: &str, ring_capacity: usize, use_semaphores: bool) -> TransportResult<Self> {
        if !ring_capacity.is_power_of_two() {
            return Err(TransportError::InvalidConfig(format!(
                "ring_buffer_capacity must be a power of two, got {}",
                ring_capacity
            )));
        }
        let shmem = ShmemConf::new()
            .os_id(segment_name)
            .open()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let control = shmem.as_ptr() as *mut ShmControlBlock;
        unsafe {
            if (*control).magic.load(Ordering::Relaxed) != MAGIC {
                return Err(TransportError::ProtocolError(
                    "shared memory segment has an unrecognized magic number".into(),
                ));
            }
            if (*control).version.load(Ordering::Relaxed) != SHM_VERSION {
                return Err(TransportError::ProtocolError(
                    "shared memory segment version mismatch".into(),
                ));
            }
        }
        let o2c_sem = Arc::new(NamedSemaphore::open(&format!("/{}_o2c", segment_name))?);
        let c2o_sem = Arc::new(NamedSemaphore::open(&format!("/{}_c2o", segment_name))?);
        let (o2c_off, c2o_off) = ShmControlBlock::data_offsets(ring_capacity);
        let base = shmem.as_ptr();
        unsafe {
            (*control).client_ready.store(true, Ordering::Release);
        }
        Ok(ShmChannel {
            _shmem: shmem,
            control,
            owner_to_client_data: unsafe { base.add(o2c_off) },
            client_to_owner_data: unsafe { base.add(c2o_off) },
            role: Role::Client,
            o2c_sem,
            c2o_sem,
            use_semaphores,
        })
    }

    fn write_side(&self) -> (&RingMeta, *mut u8) {
        match self.role {
            Role::Owner => unsafe { (&(*self.control).owner_to_client, self.owner_to_client_data) },
            Role::Client => unsafe { (&(*self.control).client_to_owner, self.client_to_owner_data) },
        }
    }

    fn read_side(&self) -> (&RingMeta, *mut u8) {
        match self.role {
            Role::Owner => unsafe { (&(*self.control).client_to_owner, self.client_to_owner_data) },
            Role::Client => unsafe { (&(*self.control).owner_to_client, self.owner_to_client_data) },
        }
    }

    fn write_sem(&self) -> Arc<NamedSemaphore> {
        match self.role {
            Role::Owner => Arc::clone(&self.o2c_sem),
            Role::Client => Arc::clone(&self.c2o_sem),
        }
    }

    fn read_sem(&self) -> Arc<NamedSemaphore> {
        match self.role {
            Role::Owner => Arc::clone(&self.c2o_sem),
            Role::Client => Arc::clone(&self.o2c_sem),
        }
    }

    fn send(&self, message: &Message, serializer: &BinarySerializer) -> TransportResult<()> {
        let bytes = serializer
            .serialize(message)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        let envelope = make_envelope(&bytes);
        let (meta, data_ptr) = self.write_side();
        unsafe { ring_write(meta, data_ptr, &envelope)? };
        if self.use_semaphores {
            self.write_sem().post();
        }
        Ok(())
    }

    fn try_recv_once(&self, serializer: &BinarySerializer) -> TransportResult<Option<Message>> {
        let (meta, data_ptr) = self.read_side();
        match unsafe { ring_read(meta, data_ptr)? } {
            Some(frame) => {
                let payload = parse_envelope(&frame)?;
                serializer
                    .deserialize(&payload)
                    .map(Some)
                    .map_err(|e| TransportError::DeserializationError(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn recv(&self, serializer: &BinarySerializer, timeout_ms: u32) -> TransportResult<Option<Message>> {
        if let Some(msg) = self.try_recv_once(serializer)? {
            return Ok(Some(msg));
        }
        if self.use_semaphores {
            let sem = self.read_sem();
            let woke = tokio::task::spawn_blocking(move || sem.wait_timeout(timeout_ms))
                .await
                .unwrap_or(false);
            if !woke {
                return Ok(None);
            }
        } else {
            tokio::time::sleep(Duration::from_millis(timeout_ms.clamp(1, 50) as u64)).await;
        }
        self.try_recv_once(serializer)
    }
}

/// `ITransport` over a POSIX shared memory segment. `config.is_server`
/// selects the "owner" role, which creates the segment(s); the other side
/// opens them.
pub struct SharedMemoryTransport {
    config: AsyncRwLock<TransportConfig>,
    state: AsyncRwLock<TransportState>,
    serializer: BinarySerializer,
    stats: TransportStatsInner,
    single: AsyncMutex<Option<Arc<ShmChannel>>>,
    connections: AsyncMutex<std::collections::HashMap<ConnectionId, Arc<ShmChannel>>>,
    multi_tx: AsyncMutex<Option<mpsc::Sender<(ConnectionId, Message)>>>,
}

impl SharedMemoryTransport {
    pub fn new(config: TransportConfig) -> Self {
        SharedMemoryTransport {
            config: AsyncRwLock::new(config),
            state: AsyncRwLock::new(TransportState::Uninitialized),
            serializer: BinarySerializer,
            stats: TransportStatsInner::default(),
            single: AsyncMutex::new(None),
            connections: AsyncMutex::new(std::collections::HashMap::new()),
            multi_tx: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl ITransport for SharedMemoryTransport {
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
        if *self.state.read().await != TransportState::Initialized {
            return Err(TransportError::NotInitialized);
        }
        if cfg.is_server {
            let channel = ShmChannel::create(&cfg.endpoint, cfg.ring_buffer_capacity, cfg.use_semaphores)?;
            *self.single.lock().await = Some(Arc::new(channel));
        }
        *self.state.write().await = TransportState::Initialized;
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        *self.state.write().await = TransportState::Disconnecting;
        self.single.lock().await.take();
        self.connections.lock().await.clear();
        *self.state.write().await = TransportState::Disconnected;
        Ok(())
    }

    async fn cleanup(&self) -> TransportResult<()> {
        self.single.lock().await.take();
        self.connections.lock().await.clear();
        Ok(())
    }

    async fn connect(&self) -> TransportResult<()> {
        let cfg = self.config.read().await.clone();
        if self.single.lock().await.is_some() {
            *self.state.write().await = TransportState::Connected;
            return Ok(());
        }
        if cfg.is_server {
            return Err(TransportError::NotInitialized);
        }
        let mut attempts = 0u32;
        let channel = loop {
            match ShmChannel::open(&cfg.endpoint, cfg.ring_buffer_capacity, cfg.use_semaphores) {
                Ok(c) => break c,
                Err(e) if attempts < 30 => {
                    attempts += 1;
                    debug!(attempts, "shared memory segment not ready yet, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = e;
                }
                Err(e) => return Err(e),
            }
        };
        *self.single.lock().await = Some(Arc::new(channel));
        *self.state.write().await = TransportState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.single.lock().await.take();
        *self.state.write().await = TransportState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.single.try_lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn send(&self, message: &Message) -> TransportResult<()> {
        let channel = self.single.lock().await.clone().ok_or(TransportError::NotConnected)?;
        let result = channel.send(message, &self.serializer);
        match &result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn send_to_connection(&self, connection_id: ConnectionId, message: &Message) -> TransportResult<()> {
        let channel = {
            let conns = self.connections.lock().await;
            conns
                .get(&connection_id)
                .cloned()
                .ok_or(TransportError::EndpointNotFound(connection_id.to_string()))?
        };
        channel.send(message, &self.serializer)
    }

    async fn receive(&self, timeout_ms: u32) -> TransportResult<Option<Message>> {
        let channel = self.single.lock().await.clone().ok_or(TransportError::NotConnected)?;
        let deadline = if timeout_ms == 0 { 100 } else { timeout_ms };
        let result = channel.recv(&self.serializer, deadline).await;
        if let Ok(Some(_)) = &result {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_err() {
            self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn state(&self) -> TransportState {
        self.state.try_read().map(|g| *g).unwrap_or(TransportState::Error)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::SharedMemory
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
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
        let (tx, rx) = mpsc::channel(1024);
        *self.multi_tx.lock().await = Some(tx.clone());
        *self.state.write().await = TransportState::Connected;

        for slot in 1..=cfg.max_connections {
            let connection_id = slot as ConnectionId;
            let segment_name = format!("{}_{}", cfg.endpoint, connection_id);
            match ShmChannel::create(&segment_name, cfg.ring_buffer_capacity, cfg.use_semaphores) {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    self.connections.lock().await.insert(connection_id, Arc::clone(&channel));
                    self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                    let serializer = self.serializer;
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        loop {
                            match channel.recv(&serializer, 1_000).await {
                                Ok(Some(message)) => {
                                    if tx.send((connection_id, message)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => continue,
                                Err(e) => {
                                    warn!(connection_id, error = %e, "shared memory connection failed");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "failed to pre-create shared memory connection slot");
                }
            }
        }
        Ok(rx)
    }

    fn active_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .try_lock()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn close_connection(&self, connection_id: ConnectionId) -> TransportResult<()> {
        if self.connections.lock().await.remove(&connection_id).is_some() {
            self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_and_detects_corruption() {
        let payload = b"hello shared memory".to_vec();
        let mut envelope = make_envelope(&payload);
        let decoded = parse_envelope(&envelope).unwrap();
        assert_eq!(decoded, payload);

        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        assert!(parse_envelope(&envelope).is_err());
    }

    #[test]
    fn create_rejects_a_non_power_of_two_ring_capacity() {
        let name = format!("/cdmf_ipc_shm_pow2_test_{}", std::process::id());
        let err = ShmChannel::create(&name, 100, false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn ring_meta_reports_available_space_within_capacity() {
        let meta = RingMeta {
            capacity: AtomicUsize::new(64),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        };
        meta.init(64);
        assert_eq!(meta.available_write_space(), 64);
        assert_eq!(meta.available_read_data(), 0);
    }
}
