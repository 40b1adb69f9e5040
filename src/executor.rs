//! Dedicated session executors
//!
//! A pool of single-threaded tokio runtimes, each pumped by its own OS
//! thread. The sharded session factory pins every session to one of these
//! for its whole life, so a session's I/O never migrates between threads.

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

pub struct ExecutorPool {
    shards: Vec<ExecutorShard>,
}

struct ExecutorShard {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ExecutorPool {
    /// Builds `count` current-thread runtimes, each parked on a dedicated
    /// `session-io-N` thread until [`ExecutorPool::shutdown`].
    pub fn new(count: usize) -> std::io::Result<Self> {
        let mut shards = Vec::with_capacity(count);
        for index in 0..count {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let handle = runtime.handle().clone();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let thread = std::thread::Builder::new()
                .name(format!("session-io-{}", index))
                .spawn(move || {
                    runtime.block_on(async {
                        let _ = shutdown_rx.await;
                    });
                })?;
            shards.push(ExecutorShard {
                handle,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            });
        }
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Spawn handles, one per shard, in shard order.
    pub fn handles(&self) -> Vec<Handle> {
        self.shards.iter().map(|s| s.handle.clone()).collect()
    }

    /// Releases every shard runtime and joins its thread. Tasks still
    /// pending on a shard are dropped, so callers stop their sessions first.
    pub fn shutdown(&mut self) {
        for shard in &mut self.shards {
            if let Some(tx) = shard.shutdown.take() {
                let _ = tx.send(());
            }
        }
        for shard in &mut self.shards {
            if let Some(thread) = shard.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
