//! Server-side stub for dispatching RPC requests to registered method
//! handlers (spec §4.G).
//!
//! The reference implementation detaches a raw `std::thread` per request
//! and has a `TODO` for handler timeouts. Here both gaps close for real:
//! each request is a spawned tokio task (so a handler panic fails only
//! that task, which is also why `panic = "abort"` was dropped from the
//! release profile) wrapped in `tokio::time::timeout` for
//! `stub_codes::HANDLER_TIMEOUT`, and concurrency is capped with a
//! `tokio::sync::Semaphore` instead of a raw atomic compare.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{stub_codes, TransportResult};
use crate::message::{Message, MessageType, SerializationFormat, HEADER_SIZE};
use crate::transport::{ConnectionId, ITransport, TransportConfig, TransportFactory, TransportRef, TransportState};

/// Boxed future returned by a `MethodHandler`.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered method implementation. Returns `Err(message)` to have the
/// stub answer with a `HANDLER_EXCEPTION` error response.
pub type MethodHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<Result<Vec<u8>, String>> + Send + Sync>;

pub type RequestValidator = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
pub type AuthenticationHandler = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
/// Invoked with `(method_name, error_message)` whenever a handler fails.
pub type ErrorHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Wraps a synchronous, infallible handler as a `MethodHandler`.
pub fn sync_handler<F>(f: F) -> MethodHandler
where
    F: Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync + 'static,
{
    Arc::new(move |data| {
        let result = f(data);
        Box::pin(async move { result }) as BoxFuture<Result<Vec<u8>, String>>
    })
}

/// Stub configuration (spec §4.G `StubConfig`).
#[derive(Clone)]
pub struct StubConfig {
    pub transport_config: TransportConfig,
    pub serialization_format: SerializationFormat,
    pub service_name: String,
    pub max_concurrent_requests: u32,
    pub request_timeout_ms: u32,
    pub enable_validation: bool,
    pub enable_authentication: bool,
    pub shutdown_timeout_ms: u32,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            transport_config: TransportConfig::default(),
            serialization_format: SerializationFormat::Binary,
            service_name: String::new(),
            max_concurrent_requests: 100,
            request_timeout_ms: 30_000,
            enable_validation: true,
            enable_authentication: false,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default)]
struct StubStatsInner {
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    error_responses: AtomicU64,
    rejected_requests: AtomicU64,
    timeout_requests: AtomicU64,
    avg_processing_time_us: AtomicU64,
    active_handlers: AtomicU32,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl StubStatsInner {
    fn snapshot(&self) -> StubStatsSnapshot {
        StubStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            error_responses: self.error_responses.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            timeout_requests: self.timeout_requests.load(Ordering::Relaxed),
            avg_processing_time_us: self.avg_processing_time_us.load(Ordering::Relaxed),
            active_handlers: self.active_handlers.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_responses.store(0, Ordering::Relaxed);
        self.error_responses.store(0, Ordering::Relaxed);
        self.rejected_requests.store(0, Ordering::Relaxed);
        self.timeout_requests.store(0, Ordering::Relaxed);
        self.avg_processing_time_us.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }

    fn record_processing_time(&self, processing_time_us: u64) {
        let total = self.total_requests.load(Ordering::Relaxed);
        let current = self.avg_processing_time_us.load(Ordering::Relaxed);
        let updated = if total > 0 {
            (current * (total - 1) + processing_time_us) / total
        } else {
            processing_time_us
        };
        self.avg_processing_time_us.store(updated, Ordering::Relaxed);
    }
}

/// Copyable snapshot of `ServiceStub::stats`.
#[derive(Debug, Clone, Default)]
pub struct StubStatsSnapshot {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub error_responses: u64,
    pub rejected_requests: u64,
    pub timeout_requests: u64,
    pub avg_processing_time_us: u64,
    pub active_handlers: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

enum Outcome {
    Rejected,
    Error,
    Success,
}

struct Inner {
    transport_config: TransportConfig,
    service_name: String,
    serialization_format: SerializationFormat,
    max_concurrent_requests: AtomicU32,
    request_timeout_ms: AtomicU32,
    enable_validation: bool,
    enable_authentication: bool,
    shutdown_timeout_ms: u32,
    transport: TransportRef,
    handlers: Mutex<HashMap<String, MethodHandler>>,
    validator: Mutex<Option<RequestValidator>>,
    auth_handler: Mutex<Option<AuthenticationHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    semaphore: Arc<Semaphore>,
    stats: StubStatsInner,
    running: AtomicBool,
}

fn wire_size(message: &Message) -> usize {
    HEADER_SIZE + message.payload.len()
}

/// Server-side RPC stub. Thread-safe: every method takes `&self`.
pub struct ServiceStub {
    inner: Arc<Inner>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceStub {
    pub fn new(config: StubConfig) -> TransportResult<Self> {
        let transport = TransportFactory::create(config.transport_config.clone())?;
        info!(service = %config.service_name, endpoint = %config.transport_config.endpoint, "creating service stub");
        let max_concurrent = config.max_concurrent_requests.max(1);
        Ok(ServiceStub {
            inner: Arc::new(Inner {
                transport_config: config.transport_config,
                service_name: config.service_name,
                serialization_format: config.serialization_format,
                max_concurrent_requests: AtomicU32::new(max_concurrent),
                request_timeout_ms: AtomicU32::new(config.request_timeout_ms),
                enable_validation: config.enable_validation,
                enable_authentication: config.enable_authentication,
                shutdown_timeout_ms: config.shutdown_timeout_ms,
                transport,
                handlers: Mutex::new(HashMap::new()),
                validator: Mutex::new(None),
                auth_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
                semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
                stats: StubStatsInner::default(),
                running: AtomicBool::new(false),
            }),
            dispatch_task: Mutex::new(None),
        })
    }

    // -- Lifecycle --------------------------------------------------------

    pub async fn start(&self) -> TransportResult<()> {
        if self.is_running() {
            debug!("service stub already running");
            return Ok(());
        }

        info!(endpoint = %self.inner.transport_config.endpoint, "starting service stub");

        if self.inner.transport.state() == TransportState::Uninitialized {
            self.inner
                .transport
                .init(self.inner.transport_config.clone())
                .await?;
        }

        // A real server accepts every peer the transport will give it, not
        // just the first. Transports that support multiple connections hand
        // back a single channel tagged with the originating connection so
        // responses can be routed back to the right caller; transports that
        // don't (none currently; kept as a fallback) get the older
        // single-connection send()/receive() pump.
        let handle = if self.inner.transport_config.is_server
            && self.inner.transport.supports_multiple_connections()
        {
            let rx = self.inner.transport.start_multi_server().await?;
            self.inner.running.store(true, Ordering::SeqCst);
            tokio::spawn(dispatch_loop_multi(Arc::clone(&self.inner), rx))
        } else {
            self.inner.transport.start().await?;
            self.inner.transport.connect().await?;
            self.inner.running.store(true, Ordering::SeqCst);
            tokio::spawn(dispatch_loop(Arc::clone(&self.inner)))
        };
        *self.dispatch_task.lock().unwrap() = Some(handle);

        info!("service stub started");
        Ok(())
    }

    pub async fn stop(&self) -> TransportResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping service stub");

        let completed = self.wait_for_pending_requests(self.inner.shutdown_timeout_ms).await;
        if !completed {
            warn!("some pending requests did not complete within the shutdown timeout");
        }

        let handle = self.dispatch_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let _ = self.inner.transport.stop().await;
        let _ = self.inner.transport.cleanup().await;

        info!("service stub stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn wait_for_pending_requests(&self, timeout_ms: u32) -> bool {
        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms as u64);
        while self.inner.stats.active_handlers.load(Ordering::Relaxed) > 0 {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    // -- Method registration ------------------------------------------------

    pub fn register_method(&self, method_name: impl Into<String>, handler: MethodHandler) -> bool {
        let method_name = method_name.into();
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.contains_key(&method_name) {
            return false;
        }
        handlers.insert(method_name, handler);
        true
    }

    pub fn unregister_method(&self, method_name: &str) -> bool {
        self.inner.handlers.lock().unwrap().remove(method_name).is_some()
    }

    pub fn has_method(&self, method_name: &str) -> bool {
        self.inner.handlers.lock().unwrap().contains_key(method_name)
    }

    pub fn registered_methods(&self) -> Vec<String> {
        self.inner.handlers.lock().unwrap().keys().cloned().collect()
    }

    // -- Hooks --------------------------------------------------------------

    pub fn set_request_validator(&self, validator: RequestValidator) {
        *self.inner.validator.lock().unwrap() = Some(validator);
    }

    pub fn set_authentication_handler(&self, handler: AuthenticationHandler) {
        *self.inner.auth_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.error_handler.lock().unwrap() = Some(handler);
    }

    // -- Configuration --------------------------------------------------------

    pub fn set_max_concurrent_requests(&self, max_requests: u32) {
        let max_requests = max_requests.max(1);
        let previous = self.inner.max_concurrent_requests.swap(max_requests, Ordering::Relaxed);
        if max_requests > previous {
            self.inner.semaphore.add_permits((max_requests - previous) as usize);
        }
        // A shrink can't revoke permits already handed out; the lower cap
        // only takes full effect once enough in-flight requests complete.
    }

    pub fn set_request_timeout_ms(&self, timeout_ms: u32) {
        self.inner.request_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    // -- Statistics -----------------------------------------------------------

    pub fn stats(&self) -> StubStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn active_handlers(&self) -> u32 {
        self.inner.stats.active_handlers.load(Ordering::Relaxed)
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    debug!("service stub dispatch loop started");
    while inner.running.load(Ordering::SeqCst) {
        match inner.transport.receive(100).await {
            Ok(Some(message)) => {
                if message.header.msg_type == MessageType::Request {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(handle_request(inner, None, message));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "service stub receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("service stub dispatch loop stopped");
}

/// Drives a multi-client transport's `(ConnectionId, Message)` channel:
/// every accepted peer's requests flow through this one loop, dispatched
/// concurrently, with each response routed back to the connection its
/// request arrived on.
async fn dispatch_loop_multi(inner: Arc<Inner>, mut rx: mpsc::Receiver<(ConnectionId, Message)>) {
    debug!("service stub dispatch loop (multi-client) started");
    while inner.running.load(Ordering::SeqCst) {
        // Bounded wait so `running` is re-checked even when no peer has
        // sent anything, the same way dispatch_loop re-checks it between
        // receive() polls.
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some((connection_id, message))) => {
                if message.header.msg_type == MessageType::Request {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(handle_request(inner, Some(connection_id), message));
                }
            }
            Ok(None) => break,
            Err(_elapsed) => {}
        }
    }
    debug!("service stub dispatch loop (multi-client) stopped");
}

async fn handle_request(inner: Arc<Inner>, connection_id: Option<ConnectionId>, message: Message) {
    inner.stats.total_requests.fetch_add(1, Ordering::Relaxed);
    inner
        .stats
        .bytes_received
        .fetch_add(wire_size(&message) as u64, Ordering::Relaxed);

    let permit = match Arc::clone(&inner.semaphore).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            let response = make_error_response(
                &inner,
                &message,
                stub_codes::MAX_REQUESTS_EXCEEDED,
                "maximum concurrent requests exceeded",
            );
            send_response(&inner, connection_id, response).await;
            inner.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    inner.stats.active_handlers.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();

    let (response, outcome) = process_request(&inner, &message).await;
    send_response(&inner, connection_id, response).await;

    match outcome {
        Outcome::Rejected => {
            inner.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
        }
        Outcome::Error => {
            inner.stats.error_responses.fetch_add(1, Ordering::Relaxed);
        }
        Outcome::Success => {
            inner.stats.successful_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    inner.stats.active_handlers.fetch_sub(1, Ordering::Relaxed);
    drop(permit);

    inner
        .stats
        .record_processing_time(start.elapsed().as_micros() as u64);
}

async fn process_request(inner: &Inner, message: &Message) -> (Message, Outcome) {
    if inner.enable_validation && !validate_request(inner, message) {
        return (
            make_error_response(inner, message, stub_codes::VALIDATION_FAILED, "request validation failed"),
            Outcome::Rejected,
        );
    }

    if inner.enable_authentication && !authenticate_request(inner, message) {
        return (
            make_error_response(inner, message, stub_codes::AUTHENTICATION_FAILED, "authentication failed"),
            Outcome::Rejected,
        );
    }

    dispatch_request(inner, message).await
}

fn validate_request(inner: &Inner, message: &Message) -> bool {
    if !message.header.validate() {
        return false;
    }
    if message.header.msg_type != MessageType::Request {
        return false;
    }
    if message.metadata.subject.is_empty() {
        return false;
    }
    match inner.validator.lock().unwrap().clone() {
        Some(validator) => validator(message),
        None => true,
    }
}

fn authenticate_request(inner: &Inner, message: &Message) -> bool {
    match inner.auth_handler.lock().unwrap().clone() {
        Some(handler) => handler(message),
        None => true,
    }
}

async fn dispatch_request(inner: &Inner, message: &Message) -> (Message, Outcome) {
    let method_name = message.metadata.subject.clone();
    let handler = inner.handlers.lock().unwrap().get(&method_name).cloned();

    let handler = match handler {
        Some(handler) => handler,
        None => {
            return (
                make_error_response(
                    inner,
                    message,
                    stub_codes::METHOD_NOT_FOUND,
                    format!("method not found: {method_name}"),
                ),
                Outcome::Error,
            );
        }
    };

    let request_data = message.payload.clone();
    let timeout = Duration::from_millis(inner.request_timeout_ms.load(Ordering::Relaxed) as u64);
    let task: JoinHandle<Result<Vec<u8>, String>> = tokio::spawn(handler(request_data));

    match tokio::time::timeout(timeout, task).await {
        Err(_elapsed) => {
            inner.stats.timeout_requests.fetch_add(1, Ordering::Relaxed);
            (
                make_error_response(inner, message, stub_codes::HANDLER_TIMEOUT, "handler exceeded timeout"),
                Outcome::Error,
            )
        }
        Ok(Err(join_err)) => {
            let detail = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                join_err.to_string()
            };
            report_error(inner, &method_name, &detail);
            (
                make_error_response(
                    inner,
                    message,
                    stub_codes::HANDLER_EXCEPTION,
                    format!("handler exception: {detail}"),
                ),
                Outcome::Error,
            )
        }
        Ok(Ok(Err(detail))) => {
            report_error(inner, &method_name, &detail);
            (
                make_error_response(
                    inner,
                    message,
                    stub_codes::HANDLER_EXCEPTION,
                    format!("handler exception: {detail}"),
                ),
                Outcome::Error,
            )
        }
        Ok(Ok(Ok(response_data))) => {
            let mut response = message.create_response(response_data);
            response.metadata.source_endpoint = inner.service_name.clone();
            let _ = inner.serialization_format;
            (response, Outcome::Success)
        }
    }
}

fn report_error(inner: &Inner, method_name: &str, detail: &str) {
    if let Some(handler) = inner.error_handler.lock().unwrap().clone() {
        handler(method_name, detail);
    }
}

fn make_error_response(inner: &Inner, request: &Message, error_code: u32, error_message: impl Into<String>) -> Message {
    let mut response = request.create_error_response(error_code, error_message);
    response.metadata.source_endpoint = inner.service_name.clone();
    response
}

async fn send_response(inner: &Inner, connection_id: Option<ConnectionId>, response: Message) {
    let size = wire_size(&response) as u64;
    let result = match connection_id {
        Some(id) => inner.transport.send_to_connection(id, &response).await,
        None => inner.transport.send(&response).await,
    };
    match result {
        Ok(()) => {
            inner.stats.bytes_sent.fetch_add(size, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(error = %e, "failed to send response");
        }
    }
}

/// Convenience constructor mirroring the reference `StubFactory`.
pub struct StubFactory;

impl StubFactory {
    pub fn create_stub(config: StubConfig) -> TransportResult<ServiceStub> {
        ServiceStub::new(config)
    }

    pub async fn create_and_start(config: StubConfig) -> TransportResult<ServiceStub> {
        let stub = ServiceStub::new(config)?;
        stub.start().await?;
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportType;

    fn test_config() -> StubConfig {
        StubConfig {
            transport_config: TransportConfig {
                transport_type: TransportType::UnixSocket,
                is_server: true,
                endpoint: "/tmp/cdmf-stub-test.sock".into(),
                ..TransportConfig::default()
            },
            service_name: "test.service".into(),
            ..StubConfig::default()
        }
    }

    #[test]
    fn register_method_rejects_duplicates() {
        let stub = ServiceStub::new(test_config()).unwrap();
        assert!(stub.register_method("echo", sync_handler(|d| Ok(d))));
        assert!(!stub.register_method("echo", sync_handler(|d| Ok(d))));
        assert!(stub.has_method("echo"));
        assert_eq!(stub.registered_methods(), vec!["echo".to_string()]);
    }

    #[test]
    fn unregister_method_reports_absence() {
        let stub = ServiceStub::new(test_config()).unwrap();
        assert!(!stub.unregister_method("missing"));
        stub.register_method("echo", sync_handler(|d| Ok(d)));
        assert!(stub.unregister_method("echo"));
        assert!(!stub.has_method("echo"));
    }

    #[tokio::test]
    async fn method_not_found_produces_stub_error_code() {
        let stub = ServiceStub::new(test_config()).unwrap();
        let inner = &stub.inner;
        let request = Message::new_request("missing.method", "client", "test.service", Vec::new(), SerializationFormat::Binary);
        let (response, outcome) = dispatch_request(inner, &request).await;
        assert!(matches!(outcome, Outcome::Error));
        assert_eq!(response.error.unwrap().error_code, stub_codes::METHOD_NOT_FOUND);
    }
}
