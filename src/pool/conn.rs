//! Generic connection pool with RAII leases.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::PoolError;

/// A connection that can live in a [`ConnPool`].
pub trait Poolable: Sized + Send + 'static {
    /// Whether the connection can still be handed out. May consume input the
    /// peer sent while the connection sat idle.
    fn is_alive(&mut self) -> bool {
        true
    }

    /// Physically tear the connection down.
    fn close(self) {}
}

/// Creates new connections on demand.
#[async_trait]
pub trait ConnFactory<C>: Send + Sync + 'static {
    async fn create(&self) -> Result<C, PoolError>;
}

struct Shared<C> {
    idle: Mutex<VecDeque<C>>,
    /// Idle plus borrowed connections.
    accounted: AtomicUsize,
    max: AtomicUsize,
    closed: AtomicBool,
    released: Notify,
    factory: Box<dyn ConnFactory<C>>,
}

impl<C: Poolable> Shared<C> {
    fn reserve_slot(&self) -> bool {
        let mut prev = self.accounted.load(Ordering::Acquire);
        loop {
            if prev >= self.max.load(Ordering::Acquire) {
                return false;
            }
            match self.accounted.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => prev = actual,
            }
        }
    }

    fn release_slot(&self) {
        let _ = self
            .accounted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.released.notify_one();
    }

    fn pop_idle(&self) -> Option<C> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn give_back(&self, mut conn: C) {
        let rejected = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let shrunk = self.accounted.load(Ordering::Acquire) > self.max.load(Ordering::Acquire);
            if self.closed.load(Ordering::Acquire) || shrunk || !conn.is_alive() {
                Some(conn)
            } else {
                idle.push_back(conn);
                None
            }
        };

        match rejected {
            Some(conn) => {
                conn.close();
                self.release_slot();
            }
            None => self.released.notify_one(),
        }
    }
}

/// Bounded pool of reusable connections.
pub struct ConnPool<C: Poolable> {
    shared: Arc<Shared<C>>,
}

impl<C: Poolable> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Poolable> std::fmt::Debug for ConnPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("max", &self.max())
            .field("accounted", &self.accounted())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl<C: Poolable> ConnPool<C> {
    /// Create a pool holding at most `max` connections, pre-creating
    /// `init_size` of them (capped at `max`).
    pub async fn new(
        max: usize,
        init_size: usize,
        factory: impl ConnFactory<C>,
    ) -> Result<Self, PoolError> {
        let pool = Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(VecDeque::with_capacity(max)),
                accounted: AtomicUsize::new(0),
                max: AtomicUsize::new(max),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                factory: Box::new(factory),
            }),
        };

        for _ in 0..init_size.min(max) {
            if !pool.shared.reserve_slot() {
                break;
            }
            match pool.shared.factory.create().await {
                Ok(conn) => pool.shared.give_back(conn),
                Err(e) => {
                    pool.shared.release_slot();
                    pool.close();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Borrow an idle connection, or create one when under capacity.
    pub async fn get(&self) -> Result<Pooled<C>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        while let Some(mut conn) = self.shared.pop_idle() {
            if conn.is_alive() {
                return Ok(self.lease(conn));
            }
            tracing::debug!("Discarding dead pooled connection");
            conn.close();
            self.shared.release_slot();
        }

        if !self.shared.reserve_slot() {
            return Err(PoolError::Exhausted);
        }

        match self.shared.factory.create().await {
            Ok(conn) => Ok(self.lease(conn)),
            Err(e) => {
                self.shared.release_slot();
                Err(e)
            }
        }
    }

    /// Like [`get`](Self::get) but parks up to `max_wait` while the pool is exhausted.
    pub async fn get_or_wait(&self, max_wait: Duration) -> Result<Pooled<C>, PoolError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.get().await {
                Err(PoolError::Exhausted) => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(PoolError::AcquireTimeout(max_wait));
            }
        }
    }

    /// Return a borrowed connection. Same as [`Pooled::close`].
    pub fn give_back(&self, conn: Pooled<C>) {
        conn.close();
    }

    /// Drop a borrowed connection from the accounting without closing it.
    pub fn remove(&self, conn: Pooled<C>) -> C {
        conn.remove()
    }

    /// Change the capacity. Surplus connections are closed as they come back.
    pub fn set_max(&self, max: usize) {
        self.shared.max.store(max, Ordering::Release);
        self.shared.released.notify_waiters();
    }

    /// Close the pool and every idle connection. Idempotent.
    pub fn close(&self) {
        let drained: Vec<C> = {
            let mut idle = self.shared.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        for conn in drained {
            conn.close();
            self.shared.release_slot();
        }
        self.shared.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.shared.max.load(Ordering::Acquire)
    }

    /// Connections currently owned by the pool, idle or borrowed.
    pub fn accounted(&self) -> usize {
        self.shared.accounted.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lease(&self, conn: C) -> Pooled<C> {
        Pooled {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A borrowed connection. Closing or dropping it returns it to the pool.
pub struct Pooled<C: Poolable> {
    conn: Option<C>,
    shared: Arc<Shared<C>>,
}

impl<C: Poolable> Pooled<C> {
    /// Release the connection back to the pool.
    pub fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.give_back(conn);
        }
    }

    /// Detach the connection from the pool, e.g. after it died on its own.
    pub fn remove(mut self) -> C {
        let conn = self.conn.take().expect("pooled connection present until released");
        self.shared.release_slot();
        conn
    }
}

impl<C: Poolable> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection present until released")
    }
}

impl<C: Poolable> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection present until released")
    }
}

impl<C: Poolable> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.give_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct TestConn {
        id: u32,
        alive: bool,
        closed: Arc<AtomicU32>,
    }

    impl Poolable for TestConn {
        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn close(self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default, Clone)]
    struct CountingFactory {
        created: Arc<AtomicU32>,
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ConnFactory<TestConn> for CountingFactory {
        async fn create(&self) -> Result<TestConn, PoolError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestConn {
                id,
                alive: true,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ConnFactory<TestConn> for FailingFactory {
        async fn create(&self) -> Result<TestConn, PoolError> {
            Err(PoolError::Factory("refused".into()))
        }
    }

    #[tokio::test]
    async fn capacity_and_reuse() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(2, 0, factory.clone()).await.unwrap();

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.get().await.err(), Some(PoolError::Exhausted));

        let reused_id = a.id;
        pool.give_back(a);
        let c = pool.get().await.unwrap();
        assert_eq!(c.id, reused_id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(pool.accounted() <= pool.max());
        drop((b, c));
    }

    #[tokio::test]
    async fn init_size_precreates() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(4, 2, factory.clone()).await.unwrap();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.accounted(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_returns_to_pool() {
        let pool = ConnPool::new(1, 0, CountingFactory::default()).await.unwrap();
        {
            let _conn = pool.get().await.unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.accounted(), 1);
    }

    #[tokio::test]
    async fn remove_frees_slot_without_closing() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(1, 0, factory.clone()).await.unwrap();
        let conn = pool.get().await.unwrap();
        let raw = pool.remove(conn);
        assert_eq!(pool.accounted(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);
        drop(raw);

        let again = pool.get().await.unwrap();
        assert_eq!(again.id, 2);
    }

    #[tokio::test]
    async fn shrunk_pool_closes_on_give_back() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(2, 0, factory.clone()).await.unwrap();
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();

        pool.set_max(1);
        a.close();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.accounted(), 1);

        b.close();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_connections_are_discarded() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(1, 0, factory.clone()).await.unwrap();
        let mut conn = pool.get().await.unwrap();
        conn.alive = false;
        conn.close();
        assert_eq!(pool.accounted(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        let fresh = pool.get().await.unwrap();
        assert_eq!(fresh.id, 2);
    }

    #[tokio::test]
    async fn get_or_wait_times_out() {
        let pool = ConnPool::new(1, 0, CountingFactory::default()).await.unwrap();
        let _held = pool.get().await.unwrap();
        let err = pool
            .get_or_wait(Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert_eq!(err, PoolError::AcquireTimeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn get_or_wait_wakes_on_release() {
        let pool = ConnPool::new(1, 0, CountingFactory::default()).await.unwrap();
        let held = pool.get().await.unwrap();
        let held_id = held.id;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_or_wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.close();

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id, held_id);
    }

    #[tokio::test]
    async fn factory_failure_releases_slot() {
        let pool = ConnPool::new(1, 0, FailingFactory).await.unwrap();
        assert!(matches!(pool.get().await, Err(PoolError::Factory(_))));
        assert_eq!(pool.accounted(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_gets() {
        let factory = CountingFactory::default();
        let pool = ConnPool::new(2, 2, factory.clone()).await.unwrap();
        let borrowed = pool.get().await.unwrap();

        pool.close();
        pool.close();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get().await.err(), Some(PoolError::Closed));

        borrowed.close();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.accounted(), 0);
    }

    #[tokio::test]
    async fn concurrent_borrowers_never_exceed_max() {
        let pool = ConnPool::new(3, 0, CountingFactory::default()).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if let Ok(conn) = pool.get_or_wait(Duration::from_secs(2)).await {
                        assert!(pool.accounted() <= pool.max());
                        tokio::task::yield_now().await;
                        conn.close();
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(pool.accounted() <= 3);
    }
}
