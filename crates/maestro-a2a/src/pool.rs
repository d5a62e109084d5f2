//! Per-destination session pool.
//!
//! Each `host:port` key owns at most one session at a time. The slot for a key
//! is guarded by its own async lock, so concurrent callers for the same key
//! queue behind one creation while different keys proceed in parallel.

use async_trait::async_trait;
use maestro_core::MaestroResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A remote destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// `http` or `https`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Target {
    /// Plain-HTTP target.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
        }
    }

    /// HTTPS destination.
    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "https".to_string(),
            ..Self::new(host, port)
        }
    }

    /// Pool key: one session per `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_url())
    }
}

/// Creates sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// The reusable session handle.
    type Session: Send + Sync + 'static;

    /// Open a new session to `target`.
    async fn connect(&self, target: &Target) -> MaestroResult<Self::Session>;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// A session unused for longer than this is considered dead.
    pub keep_alive: Duration,
    /// How often the background task evicts idle sessions.
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

struct PooledConnection<S> {
    session: Arc<S>,
    created_at: Instant,
    last_used_at: Instant,
    reuse_count: u64,
}

impl<S> PooledConnection<S> {
    fn new(session: Arc<S>, now: Instant) -> Self {
        Self {
            session,
            created_at: now,
            last_used_at: now,
            reuse_count: 0,
        }
    }

    /// Lightweight health check: used within the keep-alive window.
    fn is_healthy(&self, now: Instant, keep_alive: Duration) -> bool {
        now.duration_since(self.last_used_at) <= keep_alive
    }
}

type Slot<S> = Arc<tokio::sync::Mutex<Option<PooledConnection<S>>>>;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Sessions created by the factory.
    pub connections_created: u64,
    /// Acquisitions served by an existing session.
    pub connections_reused: u64,
    /// Sessions dropped for idleness or failure.
    pub connections_evicted: u64,
    /// Slots currently holding a session.
    pub active_connections: usize,
    /// `reused / (created + reused)`, 0 when the pool was never used.
    pub reuse_rate: f64,
}

/// Details about the session currently pooled for a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionInfo {
    /// Times the session was handed out after creation.
    pub reuse_count: u64,
    /// Time since creation.
    pub age: Duration,
    /// Time since last use.
    pub idle: Duration,
}

/// Reusable per-destination sessions with idle eviction and reuse metrics.
pub struct ConnectionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Slot<F::Session>>>,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
}

impl<F: SessionFactory> ConnectionPool<F> {
    /// Empty pool creating sessions with `factory`.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            slots: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // Slots are never removed so a key cannot end up with two live slots.
    fn slot(&self, target: &Target) -> Slot<F::Session> {
        self.slots
            .lock()
            .entry(target.key())
            .or_default()
            .clone()
    }

    /// Return the live session for `target`, creating one if needed.
    pub async fn get_or_create(&self, target: &Target) -> MaestroResult<Arc<F::Session>> {
        let slot = self.slot(target);
        let mut guard = slot.lock().await;
        let now = Instant::now();

        if let Some(conn) = guard.as_mut() {
            if conn.is_healthy(now, self.config.keep_alive) {
                conn.last_used_at = now;
                conn.reuse_count += 1;
                self.reused.fetch_add(1, Ordering::SeqCst);
                debug!(peer = %target, reuse_count = conn.reuse_count, "Reusing pooled session");
                return Ok(conn.session.clone());
            }
            debug!(peer = %target, "Pooled session expired, replacing");
            *guard = None;
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }

        let session = Arc::new(self.factory.connect(target).await?);
        self.created.fetch_add(1, Ordering::SeqCst);
        *guard = Some(PooledConnection::new(session.clone(), Instant::now()));
        info!(peer = %target, "Created pooled session");
        Ok(session)
    }

    /// Drop the session for `target` so the next call creates a fresh one.
    pub async fn invalidate(&self, target: &Target) -> bool {
        let slot = self.slot(target);
        let mut guard = slot.lock().await;
        let dropped = guard.take().is_some();
        if dropped {
            self.evicted.fetch_add(1, Ordering::SeqCst);
            debug!(peer = %target, "Pooled session invalidated");
        }
        dropped
    }

    /// Remove sessions idle past the keep-alive window. Busy keys are skipped.
    pub fn evict_idle(&self) -> usize {
        let slots: Vec<Slot<F::Session>> = self.slots.lock().values().cloned().collect();
        let now = Instant::now();
        let mut evicted = 0;
        for slot in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let expired = guard
                .as_ref()
                .is_some_and(|conn| !conn.is_healthy(now, self.config.keep_alive));
            if expired {
                *guard = None;
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::SeqCst);
        }
        evicted
    }

    /// Details of the pooled session for `target`, if any.
    pub async fn connection_info(&self, target: &Target) -> Option<ConnectionInfo> {
        let slot = self.slots.lock().get(&target.key()).cloned()?;
        let guard = slot.lock().await;
        let now = Instant::now();
        guard.as_ref().map(|conn| ConnectionInfo {
            reuse_count: conn.reuse_count,
            age: now.duration_since(conn.created_at),
            idle: now.duration_since(conn.last_used_at),
        })
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let created = self.created.load(Ordering::SeqCst);
        let reused = self.reused.load(Ordering::SeqCst);
        let active_connections = self
            .slots
            .lock()
            .values()
            .filter(|slot| slot.try_lock().map_or(true, |guard| guard.is_some()))
            .count();
        let total = created + reused;
        PoolStats {
            connections_created: created,
            connections_reused: reused,
            connections_evicted: self.evicted.load(Ordering::SeqCst),
            active_connections,
            reuse_rate: if total == 0 {
                0.0
            } else {
                reused as f64 / total as f64
            },
        }
    }
}

impl<F: SessionFactory> ConnectionPool<F> {
    /// Run [`ConnectionPool::evict_idle`] every `eviction_interval` until `cancel` fires.
    pub fn spawn_eviction(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = pool.config.eviction_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let evicted = pool.evict_idle();
                        if evicted > 0 {
                            info!(evicted, "Evicted idle pooled sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use maestro_core::MaestroError;
    use std::sync::atomic::AtomicUsize;

    struct CountingFactory {
        connects: AtomicUsize,
        fail: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        type Session = usize;

        async fn connect(&self, target: &Target) -> MaestroResult<usize> {
            // Yield so concurrent callers really overlap.
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail {
                return Err(MaestroError::ConnectionUnavailable(target.key()));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(keep_alive: Duration) -> Arc<ConnectionPool<CountingFactory>> {
        Arc::new(ConnectionPool::new(
            CountingFactory::new(),
            PoolConfig {
                keep_alive,
                eviction_interval: Duration::from_millis(10),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_key_creates_once() {
        let pool = pool(Duration::from_secs(60));
        let target = Target::new("worker", 9000);
        let n = 10;

        let sessions = join_all((0..n).map(|_| pool.get_or_create(&target))).await;
        assert!(sessions.iter().all(|s| *s.as_ref().unwrap().as_ref() == 0));

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.connections_reused, n - 1);
        let info = pool.connection_info(&target).await.unwrap();
        assert_eq!(info.reuse_count, n - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_get_own_sessions() {
        let pool = pool(Duration::from_secs(60));
        let a = Target::new("a", 1);
        let b = Target::new("a", 2);
        let (sa, sb) = tokio::join!(pool.get_or_create(&a), pool.get_or_create(&b));
        assert_ne!(sa.unwrap(), sb.unwrap());
        assert_eq!(pool.stats().connections_created, 2);
        assert_eq!(pool.stats().active_connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_replaced() {
        let pool = pool(Duration::from_millis(100));
        let target = Target::new("worker", 9000);
        let first = pool.get_or_create(&target).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        let second = pool.get_or_create(&target).await.unwrap();
        assert_ne!(first, second);
        let stats = pool.stats();
        assert_eq!(stats.connections_created, 2);
        assert_eq!(stats.connections_reused, 0);
        assert_eq!(stats.connections_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_eviction() {
        let pool = pool(Duration::from_millis(50));
        let target = Target::new("worker", 9000);
        pool.get_or_create(&target).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = pool.spawn_eviction(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(pool.connection_info(&target).await.is_none());
        assert_eq!(pool.stats().connections_evicted, 1);
        assert_eq!(pool.stats().active_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_fresh_session() {
        let pool = pool(Duration::from_secs(60));
        let target = Target::new("worker", 9000);
        let first = pool.get_or_create(&target).await.unwrap();
        assert!(pool.invalidate(&target).await);
        assert!(!pool.invalidate(&target).await);
        let second = pool.get_or_create(&target).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_errors_propagate_without_counting() {
        let pool = ConnectionPool::new(
            CountingFactory {
                connects: AtomicUsize::new(0),
                fail: true,
            },
            PoolConfig::default(),
        );
        let err = pool
            .get_or_create(&Target::new("down", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::ConnectionUnavailable(_)));
        assert_eq!(pool.stats().connections_created, 0);
        assert_eq!(pool.stats().reuse_rate, 0.0);
    }

    #[test]
    fn test_reuse_rate() {
        let pool = ConnectionPool::new(CountingFactory::new(), PoolConfig::default());
        pool.created.store(1, Ordering::SeqCst);
        pool.reused.store(4, Ordering::SeqCst);
        assert!((pool.stats().reuse_rate - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_target_key_and_url() {
        let target = Target::https("agents.example.com", 8443);
        assert_eq!(target.key(), "agents.example.com:8443");
        assert_eq!(target.base_url(), "https://agents.example.com:8443");
    }
}
