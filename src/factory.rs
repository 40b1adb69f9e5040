//! Session factories
//!
//! Factories construct sessions and keep a bounded bin of stopped ones for
//! reuse, so steady-state accept traffic does not reallocate transfer
//! buffers. Two policies: a single shared bin on one executor, and a
//! sharded pool that pins each session to a dedicated executor with its own
//! bin. A session always returns to the shard that built it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::runtime::Handle;

use crate::error::ServerError;
use crate::session::{Session, SessionConfig};

/// Observable construction/reuse accounting, mostly for statistics and
/// tests that need to see recycling happen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryCounters {
    pub created: u64,
    pub reused: u64,
    pub dropped: u64,
}

pub trait SessionFactory: Send + Sync {
    /// Hands out a `ready` session, reusing a recycled one when available.
    fn create(&self, config: &SessionConfig) -> Result<Arc<Session>, ServerError>;

    /// Returns a stopped session to its recycle bin; drops it when the bin
    /// is full.
    fn release(&self, session: Arc<Session>);

    /// Sessions currently parked in recycle bins.
    fn recycled_count(&self) -> usize;

    fn counters(&self) -> FactoryCounters;
}

#[derive(Default)]
struct CounterCells {
    created: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
}

impl CounterCells {
    fn snapshot(&self) -> FactoryCounters {
        FactoryCounters {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Pops bin entries until one resets cleanly; anything unfit for reuse is
/// dropped on the floor.
fn pop_reusable(bin: &mut VecDeque<Arc<Session>>) -> Option<Arc<Session>> {
    while let Some(session) = bin.pop_front() {
        if session.reset().is_ok() {
            return Some(session);
        }
    }
    None
}

// ============================================
// Single-executor factory
// ============================================

pub struct SimpleSessionFactory {
    executor: Handle,
    max_recycled: usize,
    recycled: StdMutex<VecDeque<Arc<Session>>>,
    counters: CounterCells,
}

impl SimpleSessionFactory {
    pub fn new(executor: Handle, max_recycled: usize) -> Self {
        Self {
            executor,
            max_recycled,
            recycled: StdMutex::new(VecDeque::new()),
            counters: CounterCells::default(),
        }
    }
}

impl SessionFactory for SimpleSessionFactory {
    fn create(&self, config: &SessionConfig) -> Result<Arc<Session>, ServerError> {
        if let Some(session) = pop_reusable(&mut self.recycled.lock().unwrap()) {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(session);
        }
        let session = Session::new(self.executor.clone(), config, 0)?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    fn release(&self, session: Arc<Session>) {
        let mut bin = self.recycled.lock().unwrap();
        if bin.len() < self.max_recycled {
            bin.push_front(session);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recycled_count(&self) -> usize {
        self.recycled.lock().unwrap().len()
    }

    fn counters(&self) -> FactoryCounters {
        self.counters.snapshot()
    }
}

// ============================================
// Sharded factory
// ============================================

struct PoolShard {
    executor: Handle,
    recycled: StdMutex<VecDeque<Arc<Session>>>,
}

pub struct PooledSessionFactory {
    shards: Vec<PoolShard>,
    max_recycled_per_shard: usize,
    /// Round-robin cursor; advances on every `create`, hit or miss.
    cursor: AtomicUsize,
    counters: CounterCells,
}

impl PooledSessionFactory {
    /// One shard per executor handle. `max_recycled_per_shard` bounds each
    /// shard's bin independently.
    pub fn new(executors: Vec<Handle>, max_recycled_per_shard: usize) -> Self {
        assert!(!executors.is_empty(), "pooled factory needs an executor");
        Self {
            shards: executors
                .into_iter()
                .map(|executor| PoolShard {
                    executor,
                    recycled: StdMutex::new(VecDeque::new()),
                })
                .collect(),
            max_recycled_per_shard,
            cursor: AtomicUsize::new(0),
            counters: CounterCells::default(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl SessionFactory for PooledSessionFactory {
    fn create(&self, config: &SessionConfig) -> Result<Arc<Session>, ServerError> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let shard = &self.shards[index];

        if let Some(session) = pop_reusable(&mut shard.recycled.lock().unwrap()) {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(session);
        }
        let session = Session::new(shard.executor.clone(), config, index)?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    fn release(&self, session: Arc<Session>) {
        // Back to the shard that built it, wherever the cursor points now.
        let shard = &self.shards[session.home_shard()];
        let mut bin = shard.recycled.lock().unwrap();
        if bin.len() < self.max_recycled_per_shard {
            bin.push_front(session);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recycled_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.recycled.lock().unwrap().len())
            .sum()
    }

    fn counters(&self) -> FactoryCounters {
        self.counters.snapshot()
    }
}
