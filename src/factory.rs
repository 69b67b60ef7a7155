//! Proxy factory: caching, lifecycle, health checking and statistics
//! aggregation for `ServiceProxy` instances (spec §4.H).
//!
//! The reference `ProxyFactory` is a process-wide singleton reached through
//! `getInstance()`, with two `std::thread`s polling on fixed intervals for
//! health checks and idle-proxy cleanup. This port keeps the same shape --
//! a cache keyed by `service_name:endpoint`, the same counters, the same
//! poll cadence -- but as two `tokio` tasks owned by the `ProxyFactory`
//! itself, and `global()` replaces the hardcoded singleton with a
//! `OnceLock` so a test can also build a private, non-global instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::proxy::{ProxyConfig, ProxyStatsSnapshot, RetryPolicy, ServiceProxy};
use crate::transport::{TransportConfig, TransportType};

/// Called periodically (or on demand) to decide whether a cached proxy is
/// still healthy. Defaults to `ServiceProxy::is_connected`.
pub type HealthCheckCallback = Arc<dyn Fn(&str, &Arc<ServiceProxy>) -> bool + Send + Sync>;
/// Invoked right after a new proxy is created (cached or not).
pub type ProxyCreatedCallback = Arc<dyn Fn(&str, &Arc<ServiceProxy>) + Send + Sync>;
/// Invoked right before a cached proxy is dropped from the cache.
pub type ProxyDestroyedCallback = Arc<dyn Fn(&str, &Arc<ServiceProxy>) + Send + Sync>;

/// `ProxyFactory` configuration (spec §4.H `ProxyFactoryConfig`).
#[derive(Clone)]
pub struct ProxyFactoryConfig {
    pub enable_caching: bool,
    pub max_cached_proxies: u32,
    pub idle_timeout_seconds: u32,
    pub enable_health_check: bool,
    pub health_check_interval_seconds: u32,
    pub enable_auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub enable_statistics: bool,
    pub default_proxy_config: ProxyConfig,
}

impl Default for ProxyFactoryConfig {
    fn default() -> Self {
        ProxyFactoryConfig {
            enable_caching: true,
            max_cached_proxies: 100,
            idle_timeout_seconds: 300,
            enable_health_check: true,
            health_check_interval_seconds: 30,
            enable_auto_reconnect: true,
            max_reconnect_attempts: 3,
            enable_statistics: true,
            default_proxy_config: ProxyConfig::default(),
        }
    }
}

/// Point-in-time view of one cached proxy (spec §4.H `ProxyInstanceInfo`).
#[derive(Clone)]
pub struct ProxyInstanceInfo {
    pub service_name: String,
    pub endpoint: String,
    pub transport_type: TransportType,
    pub created_at: Instant,
    pub last_accessed: Instant,
    /// Number of times this entry was served from the cache. The reference
    /// implementation never decrements this either -- it is an access
    /// counter, not a live strong-reference count.
    pub ref_count: u32,
    pub is_connected: bool,
    pub is_healthy: bool,
    pub last_health_check: Instant,
}

impl ProxyInstanceInfo {
    fn new(service_name: String, endpoint: String, transport_type: TransportType) -> Self {
        let now = Instant::now();
        ProxyInstanceInfo {
            service_name,
            endpoint,
            transport_type,
            created_at: now,
            last_accessed: now,
            ref_count: 0,
            is_connected: false,
            is_healthy: false,
            last_health_check: now,
        }
    }
}

/// Copyable aggregated-statistics snapshot (spec §4.H).
#[derive(Debug, Clone, Default)]
pub struct AggregatedStatsSnapshot {
    pub total_proxies_created: u64,
    pub active_proxies: u32,
    pub cached_proxies: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeout_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub health_check_failures: u64,
    pub reconnection_attempts: u64,
    pub successful_reconnections: u64,
}

#[derive(Default)]
struct AggregatedStatsInner {
    total_proxies_created: AtomicU64,
    active_proxies: AtomicU32,
    cached_proxies: AtomicU32,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    health_check_failures: AtomicU64,
    reconnection_attempts: AtomicU64,
    successful_reconnections: AtomicU64,
}

impl AggregatedStatsInner {
    fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.health_check_failures.store(0, Ordering::Relaxed);
        self.reconnection_attempts.store(0, Ordering::Relaxed);
        self.successful_reconnections.store(0, Ordering::Relaxed);
    }
}

struct CacheEntry {
    proxy: Arc<ServiceProxy>,
    info: ProxyInstanceInfo,
    config: ProxyConfig,
}

fn cache_key(service_name: &str, endpoint: &str) -> String {
    format!("{service_name}:{endpoint}")
}

/// Caches and supervises `ServiceProxy` instances. Every method takes
/// `&self`; background tasks take `Arc<ProxyFactory>` by value, same
/// "shared struct" pattern used by the transports and by `ServiceProxy`
/// itself.
pub struct ProxyFactory {
    config: Mutex<ProxyFactoryConfig>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    stats: AggregatedStatsInner,
    health_check_callback: Mutex<Option<HealthCheckCallback>>,
    proxy_created_callback: Mutex<Option<ProxyCreatedCallback>>,
    proxy_destroyed_callback: Mutex<Option<ProxyDestroyedCallback>>,
    running: AtomicBool,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

static GLOBAL: OnceLock<Arc<ProxyFactory>> = OnceLock::new();

impl ProxyFactory {
    pub fn new(config: ProxyFactoryConfig) -> Arc<Self> {
        Arc::new(ProxyFactory {
            config: Mutex::new(config),
            cache: Mutex::new(HashMap::new()),
            stats: AggregatedStatsInner::default(),
            health_check_callback: Mutex::new(None),
            proxy_created_callback: Mutex::new(None),
            proxy_destroyed_callback: Mutex::new(None),
            running: AtomicBool::new(false),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Process-wide instance, created lazily on first access with a default
    /// configuration. Mirrors `ProxyFactory::getInstance()`.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| ProxyFactory::new(ProxyFactoryConfig::default())))
    }

    /// Starts the health-check and idle-cleanup background tasks if the
    /// config enables them. Safe to call once; a second call is a no-op.
    pub async fn start_background_tasks(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("proxy factory background tasks already running");
            return false;
        }

        let (enable_health_check, enable_caching, health_interval) = {
            let config = self.config.lock().unwrap();
            (
                config.enable_health_check,
                config.enable_caching,
                config.health_check_interval_seconds,
            )
        };

        let mut tasks = self.background_tasks.lock().unwrap();
        if enable_health_check {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                health_check_loop(this, health_interval).await;
            }));
            debug!("proxy factory health check task started");
        }
        if enable_caching {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                cleanup_loop(this).await;
            }));
            debug!("proxy factory cleanup task started");
        }

        info!("proxy factory background tasks started");
        true
    }

    /// Signals background tasks to exit and waits for them to finish. They
    /// notice within one second, the same poll granularity the reference
    /// threads use so shutdown doesn't block on a long sleep.
    pub async fn stop_background_tasks(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.background_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("proxy factory background tasks stopped");
    }

    /// Disconnects and drops every cached proxy, then stops background
    /// tasks. Mirrors `ProxyFactory::shutdown()`.
    pub async fn shutdown(&self) {
        info!("proxy factory shutting down");
        self.stop_background_tasks().await;

        let entries: Vec<CacheEntry> = {
            let mut cache = self.cache.lock().unwrap();
            cache.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            self.notify_destroyed(&entry.info.service_name, &entry.proxy);
            if entry.proxy.is_connected() {
                let _ = entry.proxy.disconnect().await;
            }
        }
        info!(destroyed = count, "proxy factory shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // -- Proxy creation and retrieval -------------------------------------

    /// Gets a cached proxy for `service_name`/`config.transport_config.endpoint`,
    /// creating and caching one on a miss.
    pub fn get_proxy(&self, service_name: &str, config: ProxyConfig) -> Option<Arc<ServiceProxy>> {
        let endpoint = config.transport_config.endpoint.clone();
        let key = cache_key(service_name, &endpoint);
        let enable_caching = self.config.lock().unwrap().enable_caching;

        let mut cache = self.cache.lock().unwrap();

        if enable_caching {
            if let Some(entry) = cache.get_mut(&key) {
                entry.info.ref_count += 1;
                entry.info.last_accessed = Instant::now();
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(service = service_name, "proxy factory cache hit");
                return Some(Arc::clone(&entry.proxy));
            }
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let proxy = match ServiceProxy::new(config.clone()) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(service = service_name, error = %e, "proxy factory failed to create proxy");
                return None;
            }
        };

        self.stats.total_proxies_created.fetch_add(1, Ordering::Relaxed);
        self.stats.active_proxies.fetch_add(1, Ordering::Relaxed);

        if enable_caching {
            self.add_to_cache_locked(&mut cache, key, Arc::clone(&proxy), config, service_name, &endpoint);
        }
        drop(cache);

        self.notify_created(service_name, &proxy);
        info!(service = service_name, "proxy factory created new proxy");
        Some(proxy)
    }

    /// Convenience overload that builds a `ProxyConfig` from the factory's
    /// default template plus the given endpoint/transport type.
    pub fn get_proxy_for_endpoint(
        &self,
        service_name: &str,
        endpoint: &str,
        transport_type: TransportType,
    ) -> Option<Arc<ServiceProxy>> {
        let mut config = self.config.lock().unwrap().default_proxy_config.clone();
        config.service_name = service_name.to_string();
        config.transport_config.endpoint = endpoint.to_string();
        config.transport_config.transport_type = transport_type;
        self.get_proxy(service_name, config)
    }

    /// Creates a new proxy without consulting or populating the cache.
    pub fn create_proxy(&self, config: ProxyConfig) -> Option<Arc<ServiceProxy>> {
        let service_name = config.service_name.clone();
        let proxy = match ServiceProxy::new(config) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(service = service_name, error = %e, "proxy factory failed to create proxy");
                return None;
            }
        };
        self.stats.total_proxies_created.fetch_add(1, Ordering::Relaxed);
        self.stats.active_proxies.fetch_add(1, Ordering::Relaxed);
        self.notify_created(&service_name, &proxy);
        Some(proxy)
    }

    pub async fn create_and_connect(&self, config: ProxyConfig) -> Option<Arc<ServiceProxy>> {
        let service_name = config.service_name.clone();
        let proxy = self.create_proxy(config)?;
        if let Err(e) = proxy.connect().await {
            warn!(service = service_name, error = %e, "proxy factory connect failed");
            self.stats.active_proxies.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(proxy)
    }

    pub async fn create_and_connect_endpoint(
        &self,
        service_name: &str,
        endpoint: &str,
        transport_type: TransportType,
    ) -> Option<Arc<ServiceProxy>> {
        let mut config = self.config.lock().unwrap().default_proxy_config.clone();
        config.service_name = service_name.to_string();
        config.transport_config.endpoint = endpoint.to_string();
        config.transport_config.transport_type = transport_type;
        self.create_and_connect(config).await
    }

    // -- Cache management --------------------------------------------------

    pub fn remove_from_cache(&self, service_name: &str) {
        let mut cache = self.cache.lock().unwrap();
        let removed: Vec<CacheEntry> = remove_matching(&mut cache, |e| e.info.service_name == service_name);
        let n = removed.len() as u32;
        if n > 0 {
            self.stats.cached_proxies.fetch_sub(n, Ordering::Relaxed);
            self.stats.active_proxies.fetch_sub(n, Ordering::Relaxed);
        }
        drop(cache);
        for entry in removed {
            self.notify_destroyed(service_name, &entry.proxy);
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().unwrap();
        let removed: Vec<(String, CacheEntry)> = cache.drain().collect();
        let n = removed.len() as u32;
        self.stats.cached_proxies.fetch_sub(n.min(self.stats.cached_proxies.load(Ordering::Relaxed)), Ordering::Relaxed);
        self.stats.active_proxies.fetch_sub(n.min(self.stats.active_proxies.load(Ordering::Relaxed)), Ordering::Relaxed);
        drop(cache);
        for (name, entry) in removed {
            self.notify_destroyed(&name, &entry.proxy);
        }
        info!(count = n, "proxy factory cache cleared");
    }

    pub fn cached_proxy_count(&self) -> u32 {
        self.cache.lock().unwrap().len() as u32
    }

    pub fn is_cached(&self, service_name: &str) -> bool {
        self.cache
            .lock()
            .unwrap()
            .values()
            .any(|e| e.info.service_name == service_name)
    }

    // -- Lifecycle management ----------------------------------------------

    pub async fn destroy_proxy(&self, service_name: &str) -> bool {
        let mut cache = self.cache.lock().unwrap();
        let removed: Vec<CacheEntry> = remove_matching(&mut cache, |e| e.info.service_name == service_name);
        let n = removed.len() as u32;
        if n > 0 {
            self.stats.cached_proxies.fetch_sub(n, Ordering::Relaxed);
            self.stats.active_proxies.fetch_sub(n, Ordering::Relaxed);
        }
        drop(cache);

        let found = !removed.is_empty();
        for entry in removed {
            if entry.proxy.is_connected() {
                let _ = entry.proxy.disconnect().await;
            }
            self.notify_destroyed(service_name, &entry.proxy);
        }
        if found {
            info!(service = service_name, "proxy factory destroyed proxy");
        } else {
            warn!(service = service_name, "proxy factory: no proxy found to destroy");
        }
        found
    }

    pub async fn destroy_all_proxies(&self) {
        let entries: Vec<CacheEntry> = {
            let mut cache = self.cache.lock().unwrap();
            cache.drain().map(|(_, e)| e).collect()
        };
        let n = entries.len() as u32;
        self.stats.cached_proxies.fetch_sub(n.min(self.stats.cached_proxies.load(Ordering::Relaxed)), Ordering::Relaxed);
        self.stats.active_proxies.fetch_sub(n.min(self.stats.active_proxies.load(Ordering::Relaxed)), Ordering::Relaxed);

        for entry in entries {
            if entry.proxy.is_connected() {
                let _ = entry.proxy.disconnect().await;
            }
            self.notify_destroyed(&entry.info.service_name, &entry.proxy);
        }
        info!(count = n, "proxy factory destroyed all proxies");
    }

    pub async fn cleanup_idle_proxies(&self) -> u32 {
        let idle_timeout = Duration::from_secs(self.config.lock().unwrap().idle_timeout_seconds as u64);
        let now = Instant::now();

        let mut cache = self.cache.lock().unwrap();
        let removed: Vec<CacheEntry> =
            remove_matching(&mut cache, |e| now.duration_since(e.info.last_accessed) >= idle_timeout);
        let n = removed.len() as u32;
        if n > 0 {
            self.stats.cached_proxies.fetch_sub(n, Ordering::Relaxed);
            self.stats.active_proxies.fetch_sub(n, Ordering::Relaxed);
        }
        drop(cache);

        for entry in &removed {
            if entry.proxy.is_connected() {
                let _ = entry.proxy.disconnect().await;
            }
            self.notify_destroyed(&entry.info.service_name, &entry.proxy);
        }
        if n > 0 {
            info!(count = n, "proxy factory cleaned up idle proxies");
        }
        n
    }

    // -- Health monitoring ---------------------------------------------------

    pub async fn check_proxy_health(&self, service_name: &str) -> bool {
        let proxy = {
            let cache = self.cache.lock().unwrap();
            cache
                .values()
                .find(|e| e.info.service_name == service_name)
                .map(|e| Arc::clone(&e.proxy))
        };
        let Some(proxy) = proxy else {
            warn!(service = service_name, "proxy factory: health check target not cached");
            return false;
        };

        let healthy = self.run_health_check(service_name, &proxy);

        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.values_mut().find(|e| e.info.service_name == service_name) {
            entry.info.is_healthy = healthy;
            entry.info.last_health_check = Instant::now();
        }
        if !healthy {
            self.stats.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
        healthy
    }

    pub async fn check_all_proxies_health(&self) -> u32 {
        let targets: Vec<(String, Arc<ServiceProxy>)> = {
            let cache = self.cache.lock().unwrap();
            cache
                .values()
                .map(|e| (e.info.service_name.clone(), Arc::clone(&e.proxy)))
                .collect()
        };

        let mut unhealthy = 0u32;
        for (service_name, proxy) in &targets {
            let healthy = self.run_health_check(service_name, proxy);
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.values_mut().find(|e| &e.info.service_name == service_name) {
                entry.info.is_healthy = healthy;
                entry.info.last_health_check = Instant::now();
            }
            drop(cache);
            if !healthy {
                unhealthy += 1;
                self.stats.health_check_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        info!(total = targets.len(), unhealthy, "proxy factory checked all proxies");
        unhealthy
    }

    pub fn set_health_check_callback(&self, callback: HealthCheckCallback) {
        *self.health_check_callback.lock().unwrap() = Some(callback);
    }

    fn run_health_check(&self, service_name: &str, proxy: &Arc<ServiceProxy>) -> bool {
        let callback = self.health_check_callback.lock().unwrap().clone();
        match callback {
            Some(cb) => cb(service_name, proxy),
            None => proxy.is_connected(),
        }
    }

    pub async fn reconnect_proxy(&self, service_name: &str) -> bool {
        let proxy = {
            let cache = self.cache.lock().unwrap();
            cache
                .values()
                .find(|e| e.info.service_name == service_name)
                .map(|e| Arc::clone(&e.proxy))
        };
        let Some(proxy) = proxy else {
            warn!(service = service_name, "proxy factory: reconnect target not cached");
            return false;
        };

        self.stats.reconnection_attempts.fetch_add(1, Ordering::Relaxed);
        if proxy.is_connected() {
            let _ = proxy.disconnect().await;
        }

        let max_attempts = self.config.lock().unwrap().max_reconnect_attempts;
        let reconnected = retry_connect(&proxy, max_attempts).await;

        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.values_mut().find(|e| e.info.service_name == service_name) {
            entry.info.is_connected = reconnected;
        }
        if reconnected {
            self.stats.successful_reconnections.fetch_add(1, Ordering::Relaxed);
            info!(service = service_name, "proxy factory reconnected proxy");
        } else {
            warn!(service = service_name, attempts = max_attempts, "proxy factory failed to reconnect proxy");
        }
        reconnected
    }

    pub async fn reconnect_all_proxies(&self) -> u32 {
        let targets: Vec<(String, Arc<ServiceProxy>)> = {
            let cache = self.cache.lock().unwrap();
            cache
                .values()
                .filter(|e| !e.proxy.is_connected())
                .map(|e| (e.info.service_name.clone(), Arc::clone(&e.proxy)))
                .collect()
        };

        let max_attempts = self.config.lock().unwrap().max_reconnect_attempts;
        let mut reconnected_count = 0u32;
        for (service_name, proxy) in &targets {
            self.stats.reconnection_attempts.fetch_add(1, Ordering::Relaxed);
            let reconnected = retry_connect(proxy, max_attempts).await;
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.values_mut().find(|e| &e.info.service_name == service_name) {
                entry.info.is_connected = reconnected;
            }
            drop(cache);
            if reconnected {
                reconnected_count += 1;
                self.stats.successful_reconnections.fetch_add(1, Ordering::Relaxed);
            }
        }
        info!(
            reconnected = reconnected_count,
            attempted = targets.len(),
            "proxy factory reconnect sweep complete"
        );
        reconnected_count
    }

    // -- Configuration -------------------------------------------------------

    pub fn config(&self) -> ProxyFactoryConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn update_config(&self, config: ProxyFactoryConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn set_default_proxy_config(&self, config: ProxyConfig) {
        self.config.lock().unwrap().default_proxy_config = config;
    }

    pub fn default_proxy_config(&self) -> ProxyConfig {
        self.config.lock().unwrap().default_proxy_config.clone()
    }

    // -- Statistics ------------------------------------------------------------

    pub fn aggregated_stats(&self) -> AggregatedStatsSnapshot {
        let cache = self.cache.lock().unwrap();
        let mut total_calls = 0u64;
        let mut successful_calls = 0u64;
        let mut failed_calls = 0u64;
        let mut timeout_calls = 0u64;
        for entry in cache.values() {
            let s: ProxyStatsSnapshot = entry.proxy.stats();
            total_calls += s.total_calls;
            successful_calls += s.successful_calls;
            failed_calls += s.failed_calls;
            timeout_calls += s.timeout_calls;
        }

        AggregatedStatsSnapshot {
            total_proxies_created: self.stats.total_proxies_created.load(Ordering::Relaxed),
            active_proxies: self.stats.active_proxies.load(Ordering::Relaxed),
            cached_proxies: self.stats.cached_proxies.load(Ordering::Relaxed),
            total_calls,
            successful_calls,
            failed_calls,
            timeout_calls,
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            health_check_failures: self.stats.health_check_failures.load(Ordering::Relaxed),
            reconnection_attempts: self.stats.reconnection_attempts.load(Ordering::Relaxed),
            successful_reconnections: self.stats.successful_reconnections.load(Ordering::Relaxed),
        }
    }

    pub fn proxy_info(&self, service_name: &str) -> Option<ProxyInstanceInfo> {
        self.cache
            .lock()
            .unwrap()
            .values()
            .find(|e| e.info.service_name == service_name)
            .map(|e| e.info.clone())
    }

    pub fn all_proxy_info(&self) -> HashMap<String, ProxyInstanceInfo> {
        self.cache
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), e.info.clone()))
            .collect()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // -- Callbacks --------------------------------------------------------

    pub fn set_proxy_created_callback(&self, callback: ProxyCreatedCallback) {
        *self.proxy_created_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_proxy_destroyed_callback(&self, callback: ProxyDestroyedCallback) {
        *self.proxy_destroyed_callback.lock().unwrap() = Some(callback);
    }

    fn notify_created(&self, service_name: &str, proxy: &Arc<ServiceProxy>) {
        if let Some(cb) = self.proxy_created_callback.lock().unwrap().clone() {
            cb(service_name, proxy);
        }
    }

    fn notify_destroyed(&self, service_name: &str, proxy: &Arc<ServiceProxy>) {
        if let Some(cb) = self.proxy_destroyed_callback.lock().unwrap().clone() {
            cb(service_name, proxy);
        }
    }

    // -- Internals ----------------------------------------------------------

    fn add_to_cache_locked(
        &self,
        cache: &mut HashMap<String, CacheEntry>,
        key: String,
        proxy: Arc<ServiceProxy>,
        config: ProxyConfig,
        service_name: &str,
        endpoint: &str,
    ) {
        let max_cached = self.config.lock().unwrap().max_cached_proxies;
        if cache.len() as u32 >= max_cached {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, e)| e.info.last_accessed)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = cache.remove(&oldest_key) {
                    self.stats.cached_proxies.fetch_sub(1, Ordering::Relaxed);
                    self.notify_destroyed(&evicted.info.service_name, &evicted.proxy);
                }
            }
        }

        let mut info = ProxyInstanceInfo::new(
            service_name.to_string(),
            endpoint.to_string(),
            config.transport_config.transport_type,
        );
        info.is_connected = proxy.is_connected();
        cache.insert(key, CacheEntry { proxy, info, config });
        self.stats.cached_proxies.fetch_add(1, Ordering::Relaxed);
    }
}

/// Removes every entry matching `pred` from `cache` and returns them.
fn remove_matching(
    cache: &mut HashMap<String, CacheEntry>,
    pred: impl Fn(&CacheEntry) -> bool,
) -> Vec<CacheEntry> {
    let keys: Vec<String> = cache
        .iter()
        .filter(|(_, e)| pred(e))
        .map(|(k, _)| k.clone())
        .collect();
    keys.into_iter().filter_map(|k| cache.remove(&k)).collect()
}

/// Exponential backoff retry, matching `100ms * 2^attempt` in the reference.
async fn retry_connect(proxy: &Arc<ServiceProxy>, max_attempts: u32) -> bool {
    for attempt in 0..max_attempts {
        if proxy.connect().await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100 * (1u64 << attempt))).await;
    }
    false
}

/// Sleeps for `interval`, but in 100ms chunks so a cleared `running` flag
/// is noticed quickly instead of after the whole interval. Returns `false`
/// if the factory was stopped mid-sleep.
async fn sleep_while_running(factory: &ProxyFactory, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while factory.running.load(Ordering::Relaxed) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    factory.running.load(Ordering::Relaxed)
}

async fn health_check_loop(factory: Arc<ProxyFactory>, interval_seconds: u32) {
    let interval = Duration::from_secs(interval_seconds.max(1) as u64);
    while sleep_while_running(&factory, interval).await {
        let unhealthy = factory.check_all_proxies_health().await;
        let auto_reconnect = factory.config.lock().unwrap().enable_auto_reconnect;
        if auto_reconnect && unhealthy > 0 {
            factory.reconnect_all_proxies().await;
        }
    }
}

async fn cleanup_loop(factory: Arc<ProxyFactory>) {
    let interval = Duration::from_secs((factory.config.lock().unwrap().idle_timeout_seconds / 2).max(1) as u64);
    while sleep_while_running(&factory, interval).await {
        factory.cleanup_idle_proxies().await;
    }
}

/// Fluent `ProxyConfig` builder (spec §4.H `ProxyBuilder`). Terminal
/// methods go through `ProxyFactory::global()` the way the reference
/// `ProxyBuilder::build()` goes through `ProxyFactory::getInstance()`.
#[derive(Clone)]
pub struct ProxyBuilder {
    service_name: String,
    config: ProxyConfig,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        ProxyBuilder {
            service_name: String::new(),
            config: ProxyConfig::default(),
        }
    }
}

impl ProxyBuilder {
    pub fn new() -> Self {
        ProxyBuilder::default()
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self.config.service_name = self.service_name.clone();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.transport_config.endpoint = endpoint.into();
        self
    }

    pub fn with_transport_type(mut self, transport_type: TransportType) -> Self {
        self.config.transport_config.transport_type = transport_type;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.config.default_timeout_ms = timeout_ms;
        self.config.transport_config.connect_timeout_ms = timeout_ms;
        self.config.transport_config.send_timeout_ms = timeout_ms;
        self.config.transport_config.recv_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self.config.transport_config.auto_reconnect = enabled;
        self
    }

    pub fn with_serialization_format(mut self, format: crate::message::SerializationFormat) -> Self {
        self.config.serialization_format = format;
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.config.transport_config = config;
        self
    }

    pub fn build_config(&self) -> ProxyConfig {
        self.config.clone()
    }

    /// Gets or creates the proxy through the process-wide `ProxyFactory`.
    pub fn build(self) -> Option<Arc<ServiceProxy>> {
        ProxyFactory::global().get_proxy(&self.service_name, self.config)
    }

    pub async fn build_and_connect(self) -> Option<Arc<ServiceProxy>> {
        let proxy = self.build()?;
        if !proxy.is_connected() {
            proxy.connect().await.ok()?;
        }
        Some(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_proxy_config(service_name: &str, endpoint: &str) -> ProxyConfig {
        ProxyConfig {
            transport_config: TransportConfig {
                transport_type: TransportType::UnixSocket,
                endpoint: endpoint.to_string(),
                ..TransportConfig::default()
            },
            service_name: service_name.to_string(),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn cache_key_joins_service_and_endpoint() {
        assert_eq!(cache_key("echo", "/tmp/echo.sock"), "echo:/tmp/echo.sock");
    }

    #[test]
    fn get_proxy_caches_on_second_call() {
        let factory = ProxyFactory::new(ProxyFactoryConfig::default());
        let config = test_proxy_config("echo", "/tmp/cdmf-factory-test-1.sock");

        let first = factory.get_proxy("echo", config.clone()).unwrap();
        let second = factory.get_proxy("echo", config).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.aggregated_stats().cache_hits, 1);
        assert_eq!(factory.aggregated_stats().cache_misses, 1);
        assert_eq!(factory.cached_proxy_count(), 1);
    }

    #[test]
    fn remove_from_cache_drops_entry() {
        let factory = ProxyFactory::new(ProxyFactoryConfig::default());
        let config = test_proxy_config("echo", "/tmp/cdmf-factory-test-2.sock");
        factory.get_proxy("echo", config).unwrap();

        assert!(factory.is_cached("echo"));
        factory.remove_from_cache("echo");
        assert!(!factory.is_cached("echo"));
        assert_eq!(factory.cached_proxy_count(), 0);
    }

    #[test]
    fn eviction_picks_least_recently_accessed() {
        let mut factory_config = ProxyFactoryConfig::default();
        factory_config.max_cached_proxies = 1;
        let factory = ProxyFactory::new(factory_config);

        factory
            .get_proxy("svc-a", test_proxy_config("svc-a", "/tmp/cdmf-factory-test-a.sock"))
            .unwrap();
        factory
            .get_proxy("svc-b", test_proxy_config("svc-b", "/tmp/cdmf-factory-test-b.sock"))
            .unwrap();

        assert_eq!(factory.cached_proxy_count(), 1);
        assert!(!factory.is_cached("svc-a"));
        assert!(factory.is_cached("svc-b"));
    }

    #[test]
    fn global_returns_same_instance() {
        let a = ProxyFactory::global();
        let b = ProxyFactory::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn builder_fills_in_transport_and_proxy_config() {
        let config = ProxyBuilder::new()
            .with_service_name("svc-builder")
            .with_endpoint("/tmp/cdmf-builder-test.sock")
            .with_transport_type(TransportType::UnixSocket)
            .with_timeout_ms(2_500)
            .with_auto_reconnect(false)
            .build_config();

        assert_eq!(config.service_name, "svc-builder");
        assert_eq!(config.transport_config.endpoint, "/tmp/cdmf-builder-test.sock");
        assert_eq!(config.transport_config.transport_type, TransportType::UnixSocket);
        assert_eq!(config.default_timeout_ms, 2_500);
        assert!(!config.auto_reconnect);
    }
}
