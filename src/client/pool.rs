//! Bounded connection pool with a FIFO waiter queue.
//!
//! `acquire` hands out an idle connection when one exists, constructs a new
//! one while the pool is below `max_size`, and otherwise parks the caller
//! in a FIFO queue with an acquire timeout. A periodic sweep destroys
//! connections idle past `idle_timeout`, never dropping below `min_size`
//! total connections.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::transport::{Connection, ConnectionFactory};
use crate::error::CallError;

#[derive(Debug, Clone, Serialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 8,
            acquire_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub total: usize,
    pub waiters: usize,
    pub max_size: usize,
}

struct IdleConn {
    conn: Arc<dyn Connection>,
    last_used: Instant,
}

struct PoolInner {
    idle: VecDeque<IdleConn>,
    total: usize,
    waiters: VecDeque<oneshot::Sender<Arc<dyn Connection>>>,
    closed: bool,
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            config,
            factory,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub async fn acquire(&self) -> Result<Arc<dyn Connection>, CallError> {
        enum Plan {
            Reuse(Arc<dyn Connection>),
            Create,
            Wait(oneshot::Receiver<Arc<dyn Connection>>),
        }

        let mut dead: Vec<Arc<dyn Connection>> = Vec::new();
        let plan = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CallError::PoolShutdown);
            }
            let mut reuse = None;
            while let Some(idle) = inner.idle.pop_front() {
                if idle.conn.is_alive() {
                    reuse = Some(idle.conn);
                    break;
                }
                inner.total -= 1;
                dead.push(idle.conn);
            }
            match reuse {
                Some(conn) => Plan::Reuse(conn),
                None if inner.total < self.config.max_size => {
                    inner.total += 1;
                    Plan::Create
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
            }
        };
        for conn in dead {
            conn.destroy().await;
        }

        match plan {
            Plan::Reuse(conn) => Ok(conn),
            Plan::Create => match self.factory.connect().await {
                Ok(conn) => Ok(conn),
                Err(error) => {
                    self.inner.lock().total -= 1;
                    Err(error)
                }
            },
            Plan::Wait(rx) => {
                let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(conn)) => Ok(conn),
                    // Sender dropped: the pool was shut down.
                    Ok(Err(_)) => Err(CallError::PoolShutdown),
                    Err(_) => {
                        debug!("pool acquire timed out");
                        Err(CallError::Timeout(self.config.acquire_timeout_ms))
                    }
                }
            }
        }
    }

    /// Returns a connection to the pool: waiters are served FIFO, otherwise
    /// the connection becomes idle. Dead connections are destroyed instead.
    pub async fn release(&self, conn: Arc<dyn Connection>) {
        if !conn.is_alive() {
            self.discard(conn).await;
            return;
        }
        let destroy = {
            let mut inner = self.inner.lock();
            if inner.closed {
                inner.total -= 1;
                Some(conn)
            } else {
                let mut current = conn;
                loop {
                    match inner.waiters.pop_front() {
                        Some(waiter) => match waiter.send(current) {
                            Ok(()) => break None,
                            // Receiver timed out; try the next waiter.
                            Err(returned) => current = returned,
                        },
                        None => {
                            inner.idle.push_back(IdleConn {
                                conn: current,
                                last_used: Instant::now(),
                            });
                            break None;
                        }
                    }
                }
            }
        };
        if let Some(conn) = destroy {
            conn.destroy().await;
        }
    }

    /// Drops a connection that should not be reused (dead subprocess,
    /// poisoned transport). The next acquire constructs a fresh one.
    pub async fn discard(&self, conn: Arc<dyn Connection>) {
        self.inner.lock().total -= 1;
        conn.destroy().await;
    }

    /// Destroys idle connections older than `idle_timeout`, keeping at
    /// least `min_size` connections alive.
    pub async fn sweep(&self) {
        let expired = {
            let mut inner = self.inner.lock();
            let cutoff = Duration::from_millis(self.config.idle_timeout_ms);
            let mut expired = Vec::new();
            while inner.total > self.config.min_size {
                match inner.idle.front() {
                    Some(idle) if idle.last_used.elapsed() >= cutoff => {
                        // Idle queue is FIFO, so the front is the oldest.
                        if let Some(idle) = inner.idle.pop_front() {
                            inner.total -= 1;
                            expired.push(idle.conn);
                        }
                    }
                    _ => break,
                }
            }
            expired
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "destroying idle connections");
        }
        for conn in expired {
            conn.destroy().await;
        }
    }

    /// Tears the pool down: idle connections are destroyed, waiters are
    /// rejected with `PoolShutdown`, and in-use connections are destroyed
    /// as they are released.
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.waiters.clear();
            inner.total -= inner.idle.len();
            std::mem::take(&mut inner.idle)
        };
        for idle in idle {
            idle.conn.destroy().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle: inner.idle.len(),
            in_use: inner.total - inner.idle.len(),
            total: inner.total,
            waiters: inner.waiters.len(),
            max_size: self.config.max_size,
        }
    }
}

/// Spawns the periodic idle sweep for a shared pool.
pub fn spawn_pool_sweeper(pool: Arc<ConnectionPool>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_millis((pool.config.idle_timeout_ms / 2).max(1000));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            pool.sweep().await;
        }
    })
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.idle.is_empty() {
            warn!(idle = inner.idle.len(), "pool dropped with live connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestConn {
        alive: AtomicBool,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for TestConn {
        async fn call(
            &self,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> Result<Value, CallError> {
            Ok(Value::Null)
        }

        async fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct TestFactory {
        created: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        async fn connect(&self) -> Result<Arc<dyn Connection>, CallError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestConn {
                alive: AtomicBool::new(true),
                destroyed: self.destroyed.clone(),
            }))
        }
    }

    fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(TestFactory {
            created: created.clone(),
            destroyed: destroyed.clone(),
        });
        (ConnectionPool::new(config, factory), created, destroyed)
    }

    #[tokio::test]
    async fn acquire_release_restores_observable_size() {
        let (pool, _, _) = pool_with(PoolConfig::default());
        let before = pool.stats();
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        let after = pool.stats();
        assert_eq!(after.total, 1);
        assert_eq!(after.in_use, before.in_use);
    }

    #[tokio::test]
    async fn size_never_exceeds_max() {
        let (pool, created, _) = pool_with(PoolConfig {
            max_size: 2,
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        });
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await,
            Err(CallError::Timeout(_))
        ));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 2);
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn waiters_are_served_fifo_on_release() {
        let pool = Arc::new(
            pool_with(PoolConfig {
                max_size: 1,
                acquire_timeout_ms: 5_000,
                ..PoolConfig::default()
            })
            .0,
        );
        let conn = pool.acquire().await.unwrap();

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        // Ensure the first waiter is queued before the second.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiters, 2);

        pool.release(conn).await;
        let handed = first.await.unwrap().unwrap();
        assert!(!second.is_finished());
        pool.release(handed).await;
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_rejects_waiters_with_pool_shutdown() {
        let pool = Arc::new(
            pool_with(PoolConfig {
                max_size: 1,
                acquire_timeout_ms: 5_000,
                ..PoolConfig::default()
            })
            .0,
        );
        let conn = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CallError::PoolShutdown)
        ));
        assert!(matches!(
            pool.acquire().await,
            Err(CallError::PoolShutdown)
        ));
        // In-use connection is destroyed at release time.
        pool.release(conn).await;
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn sweep_destroys_idle_but_respects_min_size() {
        let (pool, _, destroyed) = pool_with(PoolConfig {
            min_size: 1,
            max_size: 4,
            idle_timeout_ms: 10,
            ..PoolConfig::default()
        });
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.sweep().await;
        assert_eq!(pool.stats().total, 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discarded_connections_are_replaced_on_next_acquire() {
        let (pool, created, destroyed) = pool_with(PoolConfig::default());
        let conn = pool.acquire().await.unwrap();
        pool.discard(conn).await;
        assert_eq!(pool.stats().total, 0);

        let _fresh = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
