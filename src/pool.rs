//! Worker pool (`spec.md` §4.E): bounds concurrent workers at a hard
//! ceiling and reuses idle workers across compilations.
//!
//! The ceiling of 15 is a historical constraint carried over verbatim
//! (`spec.md` §4.E: "rooted in a worker-runtime deadlock observed above
//! that threshold") — it's part of the contract, not a tunable.

use crate::engine::CompileEngine;
use crate::proto_gen::host::OutboundMessage;
use crate::worker::{self, Worker};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

pub const CEILING: usize = 15;

struct Inner {
    idle: Vec<Worker>,
    live: usize,
    next_id: u32,
    waiters: VecDeque<oneshot::Sender<Worker>>,
}

pub struct WorkerPool {
    engine: Arc<dyn CompileEngine>,
    outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
    inner: Mutex<Inner>,
}

impl WorkerPool {
    pub fn new(engine: Arc<dyn CompileEngine>, outbound_tx: UnboundedSender<(u32, OutboundMessage)>) -> Self {
        Self {
            engine,
            outbound_tx,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                live: 0,
                next_id: 1,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns an idle worker if one exists; otherwise spawns a fresh one
    /// below the ceiling; otherwise suspends until a worker is released.
    pub async fn acquire(&self) -> Worker {
        let rx = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            if let Some(worker) = inner.idle.pop() {
                return worker;
            }
            if inner.live < CEILING {
                inner.live += 1;
                let compilation_id = inner.next_id;
                inner.next_id += 1;
                drop(inner);
                return worker::spawn(compilation_id, self.engine.clone(), self.outbound_tx.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        rx.await.expect("pool dropped while a waiter was queued")
    }

    /// Returns a worker to the idle set, waking the longest-waiting caller
    /// if one is queued (fair ordering is preferred, not required, per
    /// `spec.md` §4.E).
    pub fn release(&self, worker: Worker) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        match inner.waiters.pop_front() {
            Some(waiter) => {
                // If the waiter already gave up, the worker just goes idle.
                if let Err(worker) = waiter.send(worker) {
                    inner.idle.push(worker);
                }
            }
            None => inner.idle.push(worker),
        }
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").live
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{EngineError, HostServices};
    use crate::proto_gen::host::{CompileRequest, CompileSuccess};

    struct NopEngine;
    impl CompileEngine for NopEngine {
        fn compile(
            &self,
            _request: &CompileRequest,
            _services: &HostServices,
        ) -> Result<CompileSuccess, EngineError> {
            Ok(CompileSuccess::default())
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_worker() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = WorkerPool::new(Arc::new(NopEngine), tx);

        let worker = pool.acquire().await;
        let id = worker.compilation_id;
        pool.release(worker);

        let reused = pool.acquire().await;
        assert_eq!(reused.compilation_id, id);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_respects_ceiling() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = WorkerPool::new(Arc::new(NopEngine), tx);

        let mut held = Vec::new();
        for _ in 0..CEILING {
            held.push(pool.acquire().await);
        }
        assert_eq!(pool.live_count(), CEILING);

        let waiting = tokio::time::timeout(std::time::Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "16th acquire should not resolve while the pool is saturated");
    }
}
