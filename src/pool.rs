//! Context Pool
//!
//! A bounded cache of idle execution contexts with elastic overflow:
//!
//! - `acquire` takes an idle context, waits up to the acquire timeout for one,
//!   then falls back to spawning a fresh context.
//! - `release` deposits into the idle set when there is room. Otherwise the
//!   context is parked with a deadline. A parked context is promoted into the
//!   idle set as soon as an acquirer frees a slot; if its deadline passes
//!   first, the reaper thread destroys it.
//!
//! The idle set never holds more than `capacity` contexts. The number of live
//! contexts may exceed it during a burst and settles back once the burst has
//! been quiet for longer than the release timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Creates execution contexts for a pool.
pub trait ContextFactory: Send + Sync + 'static {
    type Context: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn spawn(&self) -> Result<Self::Context, Self::Error>;
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub parked: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct Parked<C> {
    context: C,
    deadline: Instant,
}

struct Slots<C> {
    idle: VecDeque<C>,
    parked: VecDeque<Parked<C>>,
    closed: bool,
}

impl<C> Slots<C> {
    /// Take an idle context, refilling the freed slot from the parked list.
    fn take(&mut self) -> Option<C> {
        let context = self.idle.pop_front()?;
        if let Some(parked) = self.parked.pop_front() {
            self.idle.push_back(parked.context);
        }
        Some(context)
    }
}

struct Shared<F: ContextFactory> {
    factory: F,
    capacity: usize,
    acquire_timeout: Duration,
    release_timeout: Duration,
    slots: Mutex<Slots<F::Context>>,
    /// Signalled when a context enters the idle set
    returned: Condvar,
    /// Signalled when the parked list or the shutdown flag changes
    reaper_wake: Condvar,
    live: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<F: ContextFactory> Shared<F> {
    fn spawn(&self) -> Result<F::Context, F::Error> {
        let context = self.factory.spawn()?;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::Relaxed);
        trace!(live, "spawned execution context");
        Ok(context)
    }

    fn destroy(&self, context: F::Context) {
        drop(context);
        let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        trace!(live, "destroyed execution context");
    }
}

pub struct ContextPool<F: ContextFactory> {
    shared: Arc<Shared<F>>,
    reaper: Option<JoinHandle<()>>,
}

impl<F: ContextFactory> ContextPool<F> {
    /// Build a pool and spawn `config.warm_contexts` contexts into it.
    pub fn new(factory: F, config: &PoolConfig) -> Result<Self, PoolError<F::Error>> {
        let reaper = std::thread::Builder::new().name("luapool-reaper".to_string());
        Self::with_reaper(factory, config, reaper)
    }

    pub(crate) fn with_reaper(
        factory: F,
        config: &PoolConfig,
        reaper: std::thread::Builder,
    ) -> Result<Self, PoolError<F::Error>> {
        let shared = Arc::new(Shared {
            factory,
            capacity: config.capacity.max(1),
            acquire_timeout: config.acquire_timeout(),
            release_timeout: config.release_timeout(),
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(config.capacity),
                parked: VecDeque::new(),
                closed: false,
            }),
            returned: Condvar::new(),
            reaper_wake: Condvar::new(),
            live: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        });

        let warm = config.warm_contexts.min(shared.capacity);
        for _ in 0..warm {
            let context = shared.spawn().map_err(PoolError::Context)?;
            shared.slots.lock().idle.push_back(context);
        }

        let reaper_shared = Arc::clone(&shared);
        let reaper = reaper
            .spawn(move || reap(reaper_shared))
            .map_err(PoolError::Reaper)?;

        Ok(Self {
            shared,
            reaper: Some(reaper),
        })
    }

    /// Get a context, creating one if none becomes idle within the acquire timeout.
    pub fn acquire(&self) -> Result<F::Context, F::Error> {
        let mut slots = self.shared.slots.lock();
        if let Some(context) = slots.take() {
            return Ok(context);
        }

        let deadline = Instant::now() + self.shared.acquire_timeout;
        loop {
            let timed_out = self
                .shared
                .returned
                .wait_until(&mut slots, deadline)
                .timed_out();
            if let Some(context) = slots.take() {
                return Ok(context);
            }
            if timed_out {
                break;
            }
        }
        drop(slots);

        debug!(
            timeout_ms = self.shared.acquire_timeout.as_millis() as u64,
            "no idle context available, spawning overflow context"
        );
        self.shared.spawn()
    }

    /// Return a context for reuse. Never blocks on capacity.
    pub fn release(&self, context: F::Context) {
        let mut slots = self.shared.slots.lock();
        if slots.idle.len() < self.shared.capacity {
            slots.idle.push_back(context);
            drop(slots);
            self.shared.returned.notify_one();
            return;
        }

        slots.parked.push_back(Parked {
            context,
            deadline: Instant::now() + self.shared.release_timeout,
        });
        drop(slots);
        self.shared.reaper_wake.notify_one();
    }

    /// Destroy a context that must not be reused.
    pub fn discard(&self, context: F::Context) {
        self.shared.destroy(context);
    }

    /// Number of contexts currently alive, idle or not.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots.lock();
        PoolStats {
            capacity: self.shared.capacity,
            live: self.shared.live.load(Ordering::SeqCst),
            idle: slots.idle.len(),
            parked: slots.parked.len(),
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Check out a context for the duration of the returned guard.
    pub fn checkout(&self) -> Result<Checkout<'_, F>, F::Error> {
        let context = self.acquire()?;
        Ok(Checkout {
            pool: self,
            context: Some(context),
            discard: false,
        })
    }
}

impl<F: ContextFactory> Drop for ContextPool<F> {
    fn drop(&mut self) {
        let drained: Vec<F::Context> = {
            let mut slots = self.shared.slots.lock();
            slots.closed = true;
            let parked = std::mem::take(&mut slots.parked);
            let mut contexts: Vec<F::Context> = slots.idle.drain(..).collect();
            contexts.extend(parked.into_iter().map(|p| p.context));
            contexts
        };
        self.shared.reaper_wake.notify_all();

        for context in drained {
            self.shared.destroy(context);
        }

        if let Some(reaper) = self.reaper.take() {
            if reaper.join().is_err() {
                warn!("context reaper panicked");
            }
        }
    }
}

/// Destroys parked contexts whose grace period ran out.
fn reap<F: ContextFactory>(shared: Arc<Shared<F>>) {
    let mut slots = shared.slots.lock();
    loop {
        if slots.closed {
            break;
        }

        let now = Instant::now();
        let expired = slots
            .parked
            .iter()
            .take_while(|parked| parked.deadline <= now)
            .count();
        if expired > 0 {
            let contexts: Vec<Parked<F::Context>> = slots.parked.drain(..expired).collect();
            MutexGuard::unlocked(&mut slots, || {
                debug!(count = contexts.len(), "destroying contexts past release timeout");
                for parked in contexts {
                    shared.destroy(parked.context);
                }
            });
            continue;
        }

        match slots.parked.front().map(|parked| parked.deadline) {
            Some(deadline) => {
                shared.reaper_wake.wait_until(&mut slots, deadline);
            }
            None => shared.reaper_wake.wait(&mut slots),
        }
    }
}

/// A context checked out of a pool.
///
/// Dropping the guard hands the context back on every exit path, unwinding
/// included. Contexts marked with [`Checkout::discard`], or dropped while the
/// thread is panicking, are destroyed instead of reused.
pub struct Checkout<'a, F: ContextFactory> {
    pool: &'a ContextPool<F>,
    context: Option<F::Context>,
    discard: bool,
}

impl<F: ContextFactory> Checkout<'_, F> {
    pub fn context(&self) -> &F::Context {
        self.context
            .as_ref()
            .expect("context is only taken when the checkout drops")
    }

    /// Destroy the context instead of returning it.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<F: ContextFactory> Drop for Checkout<'_, F> {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        if self.discard || std::thread::panicking() {
            warn!("discarding execution context");
            self.pool.discard(context);
        } else {
            self.pool.release(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;

    #[derive(Default)]
    struct Counter {
        next: AtomicU32,
    }

    impl ContextFactory for Counter {
        type Context = u32;
        type Error = std::io::Error;

        fn spawn(&self) -> Result<u32, std::io::Error> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct Failing;

    impl ContextFactory for Failing {
        type Context = ();
        type Error = std::io::Error;

        fn spawn(&self) -> Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no room"))
        }
    }

    fn config(capacity: usize, warm: usize, acquire_ms: u64, release_ms: u64) -> PoolConfig {
        PoolConfig {
            capacity,
            warm_contexts: warm,
            acquire_timeout_ms: acquire_ms,
            release_timeout_ms: release_ms,
        }
    }

    #[test]
    fn test_warm_contexts_are_created_up_front() {
        let pool = ContextPool::new(Counter::default(), &config(4, 3, 10, 100)).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.live, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.created, 3);
    }

    #[test]
    fn test_acquire_reuses_idle_context() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 10, 100)).unwrap();

        let first = pool.acquire().unwrap();
        pool.release(first);
        let second = pool.acquire().unwrap();

        assert_eq!(first, second);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_acquire_spawns_after_timeout() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 20, 100)).unwrap();

        let held = pool.acquire().unwrap();
        let started = Instant::now();
        let overflow = pool.acquire().unwrap();

        assert_ne!(held, overflow);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn test_waiting_acquire_gets_released_context() {
        let pool = Arc::new(ContextPool::new(Counter::default(), &config(1, 1, 2_000, 100)).unwrap());
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.release(held);

        assert_eq!(waiter.join().unwrap(), held);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_release_never_exceeds_capacity() {
        let pool = ContextPool::new(Counter::default(), &config(3, 0, 1, 60_000)).unwrap();

        let contexts: Vec<u32> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.live_count(), 8);

        for context in contexts {
            pool.release(context);
            assert!(pool.stats().idle <= 3);
        }

        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.parked, 5);
        assert_eq!(stats.live, 8);
    }

    #[test]
    fn test_parked_context_fills_freed_slot() {
        let pool = ContextPool::new(Counter::default(), &config(1, 0, 1, 60_000)).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().parked, 1);

        assert_eq!(pool.acquire().unwrap(), a);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.parked, 0);
        assert_eq!(pool.acquire().unwrap(), b);
    }

    #[test]
    fn test_parked_contexts_destroyed_after_release_timeout() {
        let pool = ContextPool::new(Counter::default(), &config(2, 0, 1, 50)).unwrap();

        let contexts: Vec<u32> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        for context in contexts {
            pool.release(context);
        }
        assert_eq!(pool.live_count(), 6);

        std::thread::sleep(Duration::from_millis(300));

        let stats = pool.stats();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.parked, 0);
        assert_eq!(stats.destroyed, 4);
    }

    #[test]
    fn test_discard_decrements_live_count() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 10, 100)).unwrap();

        let context = pool.acquire().unwrap();
        pool.discard(context);

        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn test_checkout_returns_context_on_drop() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 10, 100)).unwrap();

        {
            let checkout = pool.checkout().unwrap();
            assert_eq!(*checkout.context(), 0);
            assert_eq!(pool.stats().idle, 0);
        }

        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_checkout_discard() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 10, 100)).unwrap();

        {
            let mut checkout = pool.checkout().unwrap();
            checkout.discard();
        }

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_checkout_discarded_when_unwinding() {
        let pool = ContextPool::new(Counter::default(), &config(2, 1, 10, 100)).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _checkout = pool.checkout().unwrap();
            panic!("fault while holding a context");
        }));

        assert!(result.is_err());
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_spawn_failure_propagates() {
        let result = ContextPool::new(Failing, &config(2, 1, 10, 100));
        assert!(matches!(result, Err(PoolError::Context(_))));

        let pool = ContextPool::new(Failing, &config(2, 0, 1, 100)).unwrap();
        assert!(pool.acquire().is_err());
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_reaper_start_failure_is_an_error() {
        // No platform can reserve a stack this large
        let reaper = std::thread::Builder::new().stack_size(usize::MAX / 2);

        let result = ContextPool::with_reaper(Counter::default(), &config(2, 1, 10, 100), reaper);

        assert!(matches!(result, Err(PoolError::Reaper(_))));
    }

    #[test]
    fn test_burst_grows_then_settles() {
        let capacity = 4;
        let pool = Arc::new(ContextPool::new(Counter::default(), &config(capacity, 1, 5, 300)).unwrap());
        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..20 {
                        let checkout = pool.checkout().unwrap();
                        std::thread::sleep(Duration::from_millis(2));
                        assert!(pool.stats().idle <= capacity);
                        drop(checkout);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.live_count() > capacity, "burst should overflow the pool");

        std::thread::sleep(Duration::from_millis(800));
        assert!(pool.live_count() <= capacity);
        assert!(pool.stats().idle <= capacity);
    }
}
