// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Worker Pool
//!
//! Hands out execution slots across a fixed set of [`StepExecutor`]s. The
//! pool holds one semaphore permit per slot of every worker, so a caller
//! that gets a permit is guaranteed a worker with a free slot; the lease
//! goes to the least busy such worker.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::worker::{StepExecutor, WorkerError};

pub struct WorkerPool {
    workers: Vec<Arc<dyn StepExecutor>>,
    busy: Mutex<Vec<usize>>,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: Vec<Arc<dyn StepExecutor>>) -> Result<Arc<Self>, WorkerError> {
        let capacity: usize = workers.iter().map(|w| w.slots()).sum();
        if capacity == 0 {
            return Err(WorkerError::NoWorkers);
        }
        Ok(Arc::new(Self {
            busy: Mutex::new(vec![0; workers.len()]),
            workers,
            slots: Arc::new(Semaphore::new(capacity)),
        }))
    }

    /// Total concurrent steps across all workers
    pub fn capacity(&self) -> usize {
        self.workers.iter().map(|w| w.slots()).sum()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn workers(&self) -> &[Arc<dyn StepExecutor>] {
        &self.workers
    }

    /// Waits for a free slot
    pub async fn acquire(self: &Arc<Self>) -> Result<WorkerLease, WorkerError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::NoWorkers)?;
        Ok(self.lease(permit))
    }

    /// A free slot, if one is available right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        let permit = self.slots.clone().try_acquire_owned().ok()?;
        Some(self.lease(permit))
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> WorkerLease {
        let mut busy = self.busy.lock();
        // Permits never exceed free slots, so some worker has room.
        let index = (0..self.workers.len())
            .filter(|&i| busy[i] < self.workers[i].slots())
            .min_by_key(|&i| busy[i])
            .unwrap_or(0);
        busy[index] += 1;
        WorkerLease {
            pool: self.clone(),
            index,
            _permit: permit,
        }
    }
}

/// One occupied slot on one worker; released on drop
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn executor(&self) -> &Arc<dyn StepExecutor> {
        &self.pool.workers[self.index]
    }

    pub fn worker_name(&self) -> &str {
        self.executor().name()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut busy = self.pool.busy.lock();
        busy[self.index] = busy[self.index].saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::Message;
    use crate::domain::worker::StepAssignment;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Idle {
        name: String,
        slots: usize,
    }

    #[async_trait]
    impl StepExecutor for Idle {
        fn name(&self) -> &str {
            &self.name
        }

        fn slots(&self) -> usize {
            self.slots
        }

        async fn dispatch(&self, _: StepAssignment, _: mpsc::Sender<Message>) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn cancel(&self, _: &Message) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn pool(shape: &[usize]) -> Arc<WorkerPool> {
        WorkerPool::new(
            shape
                .iter()
                .enumerate()
                .map(|(i, &slots)| {
                    Arc::new(Idle {
                        name: format!("worker-{}", i),
                        slots,
                    }) as Arc<dyn StepExecutor>
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(WorkerPool::new(vec![]), Err(WorkerError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_leases_spread_across_workers() {
        let pool = pool(&[2, 1]);
        assert_eq!(pool.capacity(), 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        let mut names = vec![a.worker_name(), b.worker_name(), c.worker_name()];
        names.sort();
        assert_eq!(names, vec!["worker-0", "worker-0", "worker-1"]);
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_its_slot() {
        let pool = pool(&[1]);
        let lease = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|l| l.worker_name().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), "worker-0");
        assert_eq!(pool.available(), 1);
    }
}
