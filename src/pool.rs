//! Worker pool for per-transaction tasks.
//!
//! A fixed multi-thread runtime stands in for the fiber pool: each
//! transaction runs as one task, suspension points (predecessor barriers,
//! trie I/O completions) yield the worker instead of blocking it, and the
//! fiber-count semaphore bounds how many transactions are in flight.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ExecutorPool {
    runtime: Runtime,
    fibers: Arc<Semaphore>,
}

impl ExecutorPool {
    pub fn new(nthreads: u32, nfibers: u32) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(nthreads.max(1) as usize)
            .thread_name("monad-exec-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            fibers: Arc::new(Semaphore::new(nfibers.max(1) as usize)),
        })
    }

    /// Submit a task; it starts once a fiber slot frees up.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let fibers = self.fibers.clone();
        self.runtime.spawn(async move {
            let _permit = fibers
                .acquire_owned()
                .await
                .expect("fiber semaphore never closes");
            future.await
        })
    }

    /// Submit a task that manages fiber permits itself; used by the
    /// block executor so a task waiting on its predecessor barrier never
    /// holds a fiber slot.
    pub(crate) fn spawn_raw<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    pub(crate) fn fiber_permits(&self) -> Arc<Semaphore> {
        self.fibers.clone()
    }

    /// Drive a block-level future to completion from the runloop thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
