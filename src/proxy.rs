//! Client-side proxy for transparent remote method invocation (spec §4.F).
//!
//! Mirrors the reference implementation's `ServiceProxy`, but the two
//! background threads it used (a receive loop plus a separate timeout
//! sweep) collapse to one: a single receive task correlates responses by
//! id, and each call's deadline is just `tokio::time::timeout` around the
//! oneshot it's waiting on. No sweep is needed because a timed-out call
//! removes its own pending-map entry before returning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{proxy_codes, TransportResult};
use crate::message::{Message, MessageType, SerializationFormat};
use crate::transport::{ITransport, TransportConfig, TransportFactory, TransportRef, TransportState};

fn hex_id(id: &Uuid) -> String {
    id.simple().to_string()
}

/// How a request is dispatched. `Sync`/`Async` differ only in whether the
/// caller awaits the result inline or via a spawned task; `OneWay` skips
/// response correlation entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Sync,
    Async,
    OneWay,
}

/// Retry behavior for `ServiceProxy::call`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u32,
    pub max_delay_ms: u32,
    pub exponential_backoff: bool,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: false,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            exponential_backoff: true,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> u32 {
        if !self.exponential_backoff {
            return self.initial_delay_ms;
        }
        let mut delay = self.initial_delay_ms as f64;
        for _ in 0..attempt {
            delay *= self.backoff_multiplier;
            if delay >= self.max_delay_ms as f64 {
                return self.max_delay_ms;
            }
        }
        delay as u32
    }
}

/// Proxy configuration (spec §4.F `ProxyConfig`).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub transport_config: TransportConfig,
    pub default_timeout_ms: u32,
    pub retry_policy: RetryPolicy,
    pub auto_reconnect: bool,
    pub serialization_format: SerializationFormat,
    pub service_name: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            transport_config: TransportConfig::default(),
            default_timeout_ms: 5_000,
            retry_policy: RetryPolicy::default(),
            auto_reconnect: true,
            serialization_format: SerializationFormat::Binary,
            service_name: String::new(),
        }
    }
}

/// Outcome of a single `call`/`call_async` invocation.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub success: bool,
    pub data: Vec<u8>,
    pub error_code: u32,
    pub error_message: String,
    pub retry_count: u32,
    pub duration: Duration,
}

impl CallResult {
    fn failure(error_code: u32, error_message: impl Into<String>, retry_count: u32) -> Self {
        CallResult {
            success: false,
            data: Vec::new(),
            error_code,
            error_message: error_message.into(),
            retry_count,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct ProxyStatsInner {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    timeout_calls: AtomicU64,
    total_retries: AtomicU64,
    avg_response_time_us: AtomicU64,
    active_calls: AtomicU32,
}

impl ProxyStatsInner {
    fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            timeout_calls: self.timeout_calls.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            avg_response_time_us: self.avg_response_time_us.load(Ordering::Relaxed),
            active_calls: self.active_calls.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.timeout_calls.store(0, Ordering::Relaxed);
        self.total_retries.store(0, Ordering::Relaxed);
        self.avg_response_time_us.store(0, Ordering::Relaxed);
    }

    /// Simple moving average, matching the reference implementation.
    fn record_response_time(&self, response_time_us: u64) {
        let total = self.total_calls.load(Ordering::Relaxed);
        let current = self.avg_response_time_us.load(Ordering::Relaxed);
        let updated = if total > 0 {
            (current * (total - 1) + response_time_us) / total
        } else {
            response_time_us
        };
        self.avg_response_time_us.store(updated, Ordering::Relaxed);
    }
}

/// Copyable snapshot of `ServiceProxy::stats`.
#[derive(Debug, Clone, Default)]
pub struct ProxyStatsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeout_calls: u64,
    pub total_retries: u64,
    pub avg_response_time_us: u64,
    pub active_calls: u32,
}

struct Inner {
    transport_config: TransportConfig,
    service_name: String,
    serialization_format: SerializationFormat,
    auto_reconnect: bool,
    transport: TransportRef,
    default_timeout_ms: AtomicU32,
    retry_policy: Mutex<RetryPolicy>,
    stats: ProxyStatsInner,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    running: AtomicBool,
}

/// Client-side RPC proxy. Thread-safe: every method takes `&self` and may
/// be called concurrently from many tasks.
pub struct ServiceProxy {
    inner: Arc<Inner>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceProxy {
    pub fn new(config: ProxyConfig) -> TransportResult<Self> {
        let transport = TransportFactory::create(config.transport_config.clone())?;
        info!(service = %config.service_name, endpoint = %config.transport_config.endpoint, "creating service proxy");
        Ok(ServiceProxy {
            inner: Arc::new(Inner {
                transport_config: config.transport_config,
                service_name: config.service_name,
                serialization_format: config.serialization_format,
                auto_reconnect: config.auto_reconnect,
                transport,
                default_timeout_ms: AtomicU32::new(config.default_timeout_ms),
                retry_policy: Mutex::new(config.retry_policy),
                stats: ProxyStatsInner::default(),
                pending: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            receive_task: Mutex::new(None),
        })
    }

    // -- Connection management --------------------------------------

    pub async fn connect(&self) -> TransportResult<()> {
        if self.is_connected() {
            debug!("service proxy already connected");
            return Ok(());
        }

        info!(endpoint = %self.inner.transport_config.endpoint, "connecting service proxy");

        if self.inner.transport.state() == TransportState::Uninitialized {
            self.inner
                .transport
                .init(self.inner.transport_config.clone())
                .await?;
        }
        self.inner.transport.start().await?;
        self.inner.transport.connect().await?;

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(receive_loop(inner));
        *self.receive_task.lock().unwrap() = Some(handle);

        info!("service proxy connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> TransportResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("disconnecting service proxy");

        let handle = self.receive_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let disconnect_result = self.inner.transport.disconnect().await;
        let _ = self.inner.transport.stop().await;
        let _ = self.inner.transport.cleanup().await;

        // Dropping each sender completes its receiver with a RecvError,
        // which `send_and_receive` surfaces as RECEIVE_FAILED -- no pending
        // call is left hanging past disconnect.
        self.inner.pending.lock().unwrap().clear();

        disconnect_result
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    // -- Synchronous calls --------------------------------------------

    pub async fn call(&self, method_name: &str, request_data: &[u8], timeout_ms: u32) -> CallResult {
        let timeout_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            self.inner.default_timeout_ms.load(Ordering::Relaxed)
        };
        self.send_and_receive(method_name, request_data, Duration::from_millis(timeout_ms as u64))
            .await
    }

    // -- Asynchronous calls ---------------------------------------------

    /// Spawns the call on the runtime; requires the proxy to be held behind
    /// an `Arc` so the task can outlive the caller's stack frame.
    pub fn call_async(
        self: &Arc<Self>,
        method_name: impl Into<String>,
        request_data: Vec<u8>,
        timeout_ms: u32,
    ) -> JoinHandle<CallResult> {
        let this = Arc::clone(self);
        let method_name = method_name.into();
        tokio::spawn(async move { this.call(&method_name, &request_data, timeout_ms).await })
    }

    pub fn call_async_with_callback<F>(
        self: &Arc<Self>,
        method_name: impl Into<String>,
        request_data: Vec<u8>,
        timeout_ms: u32,
        callback: F,
    ) where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let this = Arc::clone(self);
        let method_name = method_name.into();
        tokio::spawn(async move {
            let result = this.call(&method_name, &request_data, timeout_ms).await;
            callback(result);
        });
    }

    // -- One-way calls --------------------------------------------------

    pub async fn call_one_way(&self, method_name: &str, request_data: &[u8]) -> bool {
        if !self.is_connected() {
            warn!(method = method_name, "one-way call failed: not connected");
            return false;
        }

        let mut request = self.create_request(method_name, request_data);
        request.mark_oneway();

        self.inner.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.transport.send(&request).await {
            Ok(()) => {
                self.inner.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(method = method_name, error = %e, "one-way call failed");
                self.inner.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    // -- Configuration ----------------------------------------------------

    pub fn config(&self) -> ProxyConfig {
        ProxyConfig {
            transport_config: self.inner.transport_config.clone(),
            default_timeout_ms: self.inner.default_timeout_ms.load(Ordering::Relaxed),
            retry_policy: self.inner.retry_policy.lock().unwrap().clone(),
            auto_reconnect: self.inner.auto_reconnect,
            serialization_format: self.inner.serialization_format,
            service_name: self.inner.service_name.clone(),
        }
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.inner.retry_policy.lock().unwrap() = policy;
    }

    pub fn set_default_timeout_ms(&self, timeout_ms: u32) {
        self.inner.default_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    // -- Statistics -------------------------------------------------------

    pub fn stats(&self) -> ProxyStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn active_calls(&self) -> u32 {
        self.inner.stats.active_calls.load(Ordering::Relaxed)
    }

    // -- Internals --------------------------------------------------------

    fn create_request(&self, method_name: &str, request_data: &[u8]) -> Message {
        Message::new_request(
            method_name,
            self.inner.service_name.clone(),
            self.inner.transport_config.endpoint.clone(),
            request_data.to_vec(),
            self.inner.serialization_format,
        )
    }

    async fn send_and_receive(&self, method_name: &str, request_data: &[u8], timeout: Duration) -> CallResult {
        let start = Instant::now();
        let mut retry_count = 0u32;

        let result = loop {
            if !self.is_connected() {
                break CallResult::failure(proxy_codes::NOT_CONNECTED, "not connected to service", retry_count);
            }

            self.inner.stats.total_calls.fetch_add(1, Ordering::Relaxed);
            self.inner.stats.active_calls.fetch_add(1, Ordering::Relaxed);

            let request = self.create_request(method_name, request_data);
            let call_id = hex_id(&request.header.message_id);
            let (tx, rx) = oneshot::channel();
            self.inner.pending.lock().unwrap().insert(call_id.clone(), tx);

            trace!(method = method_name, call_id = %call_id, attempt = retry_count, "sending request");

            if let Err(e) = self.inner.transport.send(&request).await {
                self.inner.pending.lock().unwrap().remove(&call_id);
                self.inner.stats.active_calls.fetch_sub(1, Ordering::Relaxed);

                if let Some(delay) = self.next_retry_delay(retry_count) {
                    warn!(method = method_name, error = %e, "send failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    retry_count += 1;
                    continue;
                }

                self.inner.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                break CallResult::failure(proxy_codes::SEND_FAILED, format!("failed to send request: {e}"), retry_count);
            }

            match tokio::time::timeout(timeout, rx).await {
                Err(_elapsed) => {
                    self.inner.pending.lock().unwrap().remove(&call_id);
                    self.inner.stats.active_calls.fetch_sub(1, Ordering::Relaxed);

                    if let Some(delay) = self.next_retry_delay(retry_count) {
                        warn!(method = method_name, call_id = %call_id, "request timed out, retrying");
                        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                        retry_count += 1;
                        continue;
                    }

                    self.inner.stats.timeout_calls.fetch_add(1, Ordering::Relaxed);
                    self.inner.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                    break CallResult::failure(proxy_codes::TIMEOUT, "request timeout", retry_count);
                }
                Ok(Err(_closed)) => {
                    self.inner.stats.active_calls.fetch_sub(1, Ordering::Relaxed);
                    self.inner.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                    break CallResult::failure(proxy_codes::RECEIVE_FAILED, "response channel closed", retry_count);
                }
                Ok(Ok(response)) => {
                    self.inner.stats.active_calls.fetch_sub(1, Ordering::Relaxed);
                    if let Some(err) = &response.error {
                        self.inner.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                        break CallResult::failure(err.error_code, err.error_message.clone(), retry_count);
                    }
                    self.inner.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                    break CallResult {
                        success: true,
                        data: response.payload,
                        error_code: 0,
                        error_message: String::new(),
                        retry_count,
                        duration: Duration::ZERO,
                    };
                }
            }
        };

        let elapsed = start.elapsed();
        self.inner.stats.record_response_time(elapsed.as_micros() as u64);
        CallResult { duration: elapsed, ..result }
    }

    fn next_retry_delay(&self, retry_count: u32) -> Option<u32> {
        let policy = self.inner.retry_policy.lock().unwrap();
        if policy.enabled && retry_count < policy.max_attempts {
            self.inner.stats.total_retries.fetch_add(1, Ordering::Relaxed);
            Some(policy.delay_for(retry_count))
        } else {
            None
        }
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    debug!("service proxy receive loop started");
    while inner.running.load(Ordering::SeqCst) {
        match inner.transport.receive(100).await {
            Ok(Some(message)) => {
                if matches!(message.header.msg_type, MessageType::Response | MessageType::Error) {
                    handle_response(&inner, message);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "service proxy receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("service proxy receive loop stopped");
}

fn handle_response(inner: &Inner, message: Message) {
    let key = hex_id(&message.header.correlation_id);
    let sender = inner.pending.lock().unwrap().remove(&key);
    match sender {
        Some(sender) => {
            let _ = sender.send(message);
        }
        None => trace!(call_id = %key, "no pending call for response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_retry_delay_ignores_backoff() {
        let policy = RetryPolicy {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            exponential_backoff: false,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), 100);
        assert_eq!(policy.delay_for(4), 100);
    }

    #[test]
    fn exponential_retry_delay_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), 100);
        assert_eq!(policy.delay_for(1), 200);
        assert_eq!(policy.delay_for(2), 400);
        assert_eq!(policy.delay_for(10), 5_000);
    }

    #[test]
    fn call_result_failure_has_zero_duration_and_no_data() {
        let r = CallResult::failure(proxy_codes::TIMEOUT, "request timeout", 2);
        assert!(!r.success);
        assert!(r.data.is_empty());
        assert_eq!(r.error_code, proxy_codes::TIMEOUT);
        assert_eq!(r.retry_count, 2);
    }

    #[test]
    fn moving_average_matches_reference_formula() {
        let stats = ProxyStatsInner::default();
        stats.total_calls.store(1, Ordering::Relaxed);
        stats.record_response_time(100);
        assert_eq!(stats.avg_response_time_us.load(Ordering::Relaxed), 100);

        stats.total_calls.store(2, Ordering::Relaxed);
        stats.record_response_time(300);
        // (100 * 1 + 300) / 2 = 200
        assert_eq!(stats.avg_response_time_us.load(Ordering::Relaxed), 200);
    }
}
