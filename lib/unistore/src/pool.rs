//! Generic acquire/release/destroy lifecycle for opaque backend connections.
//!
//! Concurrency is bounded by `max` connections; callers over the bound queue
//! FIFO behind a timeout, and releases hand connections directly to the
//! oldest waiter. A periodic reaper retires idle connections down to `min`
//! and tops the pool back up to `min`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{Connection, Driver};
use crate::error::DbError;

/// Connection-lifecycle configuration for one pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max: usize,
    pub min: usize,
    /// Idle connections older than this are reaped.
    pub idle: Duration,
    /// How long an acquire waits for a free connection.
    pub acquire_timeout: Duration,
    /// Waiters beyond this bound fail immediately.
    pub max_queue: usize,
    pub reap_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max: 16,
            min: 0,
            idle: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
            max_queue: 256,
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time pool counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub busy: usize,
    pub waiting: usize,
}

struct Idle {
    conn: Box<dyn Connection>,
    last_used: Instant,
}

struct PoolState {
    available: Vec<Idle>,
    busy: usize,
    waiters: VecDeque<oneshot::Sender<Box<dyn Connection>>>,
    closed: bool,
}

/// Generic resource pool; knows nothing about the backend beyond the
/// driver's open/close operations.
pub struct ResourcePool {
    driver: Arc<dyn Driver>,
    opts: PoolOptions,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(driver: Arc<dyn Driver>, opts: PoolOptions) -> Self {
        ResourcePool {
            driver,
            opts,
            state: Mutex::new(PoolState {
                available: Vec::new(),
                busy: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            available: state.available.len(),
            busy: state.busy,
            waiting: state.waiters.len(),
        }
    }

    /// Acquire a connection: reuse an available one, open a new one while
    /// under `max`, otherwise queue behind a timeout.
    pub async fn acquire(&self) -> Result<Box<dyn Connection>, DbError> {
        let waiter = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DbError::ResourceExhausted(format!(
                    "pool {} is shut down",
                    self.driver.kind()
                )));
            }
            if let Some(idle) = state.available.pop() {
                state.busy += 1;
                return Ok(idle.conn);
            }
            if state.busy < self.opts.max {
                // Reserve the slot; open outside the lock.
                state.busy += 1;
                None
            } else {
                if state.waiters.len() >= self.opts.max_queue {
                    return Err(DbError::ResourceExhausted(format!(
                        "pool {} wait queue is full",
                        self.driver.kind()
                    )));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match waiter {
            None => match self.driver.open().await {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    self.state.lock().busy -= 1;
                    Err(err)
                }
            },
            Some(mut rx) => {
                match tokio::time::timeout(self.opts.acquire_timeout, &mut rx).await {
                    Ok(Ok(conn)) => Ok(conn),
                    // Sender dropped: the pool shut down while we were queued.
                    Ok(Err(_)) => Err(DbError::ResourceExhausted(format!(
                        "pool {} is shut down",
                        self.driver.kind()
                    ))),
                    Err(_) => {
                        // Timed out, but release may have handed us a
                        // connection in the same instant. Closing the channel
                        // makes any later send fail back to release, which
                        // moves on to the next waiter; anything already sent
                        // is still ours to claim.
                        rx.close();
                        match rx.try_recv() {
                            Ok(conn) => Ok(conn),
                            Err(_) => Err(DbError::ResourceExhausted(format!(
                                "pool {} acquire timed out after {:?}",
                                self.driver.kind(),
                                self.opts.acquire_timeout
                            ))),
                        }
                    }
                }
            }
        }
    }

    /// Return a connection: hand it to the oldest live waiter, destroy it if
    /// the pool is over `max` or closed, else park it as available.
    pub async fn release(&self, mut conn: Box<dyn Connection>) {
        let destroy = {
            let mut state = self.state.lock();
            loop {
                match state.waiters.pop_front() {
                    Some(tx) => match tx.send(conn) {
                        // Handed off; the connection stays busy.
                        Ok(()) => return,
                        // Waiter gave up; try the next one.
                        Err(returned) => conn = returned,
                    },
                    None => break,
                }
            }
            state.busy -= 1;
            if state.closed || state.busy + state.available.len() >= self.opts.max {
                true
            } else {
                state.available.push(Idle {
                    conn,
                    last_used: Instant::now(),
                });
                return;
            }
        };
        if destroy {
            self.driver.close(conn).await;
        }
    }

    /// Destroy a connection known to be broken instead of returning it.
    pub async fn destroy(&self, conn: Box<dyn Connection>) {
        self.state.lock().busy -= 1;
        self.driver.close(conn).await;
    }

    /// One maintenance pass: reap idle connections above `min`, then top the
    /// pool up to `min`.
    pub async fn maintain(&self) {
        let mut to_close = Vec::new();
        let deficit = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut total = state.busy + state.available.len();
            let mut index = 0;
            while index < state.available.len() {
                if total > self.opts.min && state.available[index].last_used.elapsed() > self.opts.idle
                {
                    to_close.push(state.available.swap_remove(index).conn);
                    total -= 1;
                } else {
                    index += 1;
                }
            }
            self.opts.min.saturating_sub(total)
        };
        if !to_close.is_empty() {
            debug!(pool = self.driver.kind(), reaped = to_close.len(), "reaping idle connections");
        }
        for conn in to_close {
            self.driver.close(conn).await;
        }
        for _ in 0..deficit {
            match self.driver.open().await {
                Ok(conn) => {
                    let leftover = {
                        let mut state = self.state.lock();
                        if state.closed {
                            Some(conn)
                        } else {
                            state.available.push(Idle {
                                conn,
                                last_used: Instant::now(),
                            });
                            None
                        }
                    };
                    if let Some(conn) = leftover {
                        self.driver.close(conn).await;
                        return;
                    }
                }
                Err(err) => {
                    warn!(pool = self.driver.kind(), error = %err, "pool top-up failed");
                    return;
                }
            }
        }
    }

    /// Spawn the periodic reaper for this pool.
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.opts.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.state.lock().closed {
                    return;
                }
                pool.maintain().await;
            }
        })
    }

    /// Refuse new work, destroy available connections, and optionally wait
    /// for busy ones to drain.
    pub async fn shutdown(&self, deadline: Option<Duration>) {
        let available = {
            let mut state = self.state.lock();
            state.closed = true;
            // Dropping the senders wakes queued waiters with an error.
            state.waiters.clear();
            std::mem::take(&mut state.available)
        };
        for idle in available {
            self.driver.close(idle.conn).await;
        }
        if let Some(deadline) = deadline {
            let start = Instant::now();
            while self.state.lock().busy > 0 && start.elapsed() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Request;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubConn;

    impl Connection for StubConn {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct StubDriver {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl StubDriver {
        fn new() -> Arc<Self> {
            Arc::new(StubDriver {
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Driver for StubDriver {
        fn kind(&self) -> &'static str {
            "stub"
        }

        async fn open(&self) -> Result<Box<dyn Connection>, DbError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubConn))
        }

        async fn close(&self, _conn: Box<dyn Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn query(
            &self,
            _conn: &mut dyn Connection,
            _req: &mut Request,
        ) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn options(max: usize) -> PoolOptions {
        PoolOptions {
            max,
            acquire_timeout: Duration::from_millis(100),
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn reuses_available_connections() {
        let driver = StubDriver::new();
        let pool = ResourcePool::new(driver.clone(), options(4));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_never_exceeds_max() {
        let driver = StubDriver::new();
        let pool = Arc::new(ResourcePool::new(driver.clone(), options(2)));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().busy, 2);

        // Third acquire queues; a release hands the connection over.
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;
        pool.release(a).await;
        let handed = waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().busy, 2);
        assert_eq!(driver.opened.load(Ordering::SeqCst), 2);

        pool.release(b).await;
        pool.release(handed).await;
    }

    #[tokio::test]
    async fn acquire_times_out_when_saturated() {
        let driver = StubDriver::new();
        let pool = ResourcePool::new(driver, options(1));

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), "ResourceExhausted");
    }

    #[tokio::test]
    async fn full_wait_queue_fails_immediately() {
        let driver = StubDriver::new();
        let pool = Arc::new(ResourcePool::new(
            driver,
            PoolOptions {
                max: 1,
                max_queue: 1,
                acquire_timeout: Duration::from_secs(5),
                ..PoolOptions::default()
            },
        ));

        let _held = pool.acquire().await.unwrap();
        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), "ResourceExhausted");
        assert!(started.elapsed() < Duration::from_secs(1));
        queued.abort();
    }

    #[tokio::test]
    async fn maintain_tops_up_to_min_and_reaps_idle() {
        let driver = StubDriver::new();
        let pool = ResourcePool::new(
            driver.clone(),
            PoolOptions {
                max: 4,
                min: 2,
                idle: Duration::ZERO,
                ..PoolOptions::default()
            },
        );

        pool.maintain().await;
        assert_eq!(pool.stats().available, 2);

        // Idle timeout of zero reaps down to min, never below.
        pool.maintain().await;
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_tops_up_in_background() {
        let driver = StubDriver::new();
        let pool = Arc::new(ResourcePool::new(
            driver.clone(),
            PoolOptions {
                max: 4,
                min: 1,
                reap_interval: Duration::from_millis(10),
                ..PoolOptions::default()
            },
        ));

        let handle = pool.start_reaper();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(pool.stats().available >= 1);
        assert!(driver.opened.load(Ordering::SeqCst) >= 1);
        handle.abort();
    }

    #[tokio::test]
    async fn timed_out_waiter_does_not_leak_slot() {
        let driver = StubDriver::new();
        let pool = Arc::new(ResourcePool::new(driver.clone(), options(1)));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), "ResourceExhausted");

        // The abandoned waiter must not swallow the returned connection.
        pool.release(held).await;
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(pool.stats().available, 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let driver = StubDriver::new();
        let pool = ResourcePool::new(driver.clone(), options(2));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        pool.shutdown(None).await;
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
        assert!(pool.acquire().await.is_err());
    }
}
