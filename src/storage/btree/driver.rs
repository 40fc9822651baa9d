//! Dispatch loop for many in-flight deletes sharing one page cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use super::delete::{DeleteOperation, DeleteResult, Progress};
use super::stats::DeleteStats;
use crate::primitives::pager::{Completion, CompletionEvent, PageCache};
use crate::types::{ArborError, Result, WaiterId};

/// A delete that left the driver.
#[derive(Debug)]
pub struct Finished {
    /// Waiter the operation ran as.
    pub waiter: WaiterId,
    /// Key it deleted.
    pub key: u64,
    /// Its outcome.
    pub outcome: Result<DeleteResult>,
}

/// Owns in-flight [`DeleteOperation`]s and routes cache completions to them.
///
/// Operations are interleaved at the granularity of `resume` calls: ready
/// operations run first, and when none is ready the oldest queued completion
/// is polled and handed to the waiter it is addressed to.
pub struct DeleteDriver {
    cache: Arc<dyn PageCache>,
    running: HashMap<WaiterId, DeleteOperation>,
    ready: VecDeque<WaiterId>,
    finished: Vec<Finished>,
    stats: Arc<DeleteStats>,
    step_budget: Option<usize>,
}

impl DeleteDriver {
    /// Creates a driver over `cache`.
    pub fn new(cache: Arc<dyn PageCache>) -> Self {
        Self {
            cache,
            running: HashMap::new(),
            ready: VecDeque::new(),
            finished: Vec::new(),
            stats: Arc::new(DeleteStats::default()),
            step_budget: None,
        }
    }

    /// Gives each submitted operation a per-resume step budget.
    pub fn with_step_budget(mut self, steps: usize) -> Self {
        self.step_budget = Some(steps);
        self
    }

    /// Counters shared by every operation this driver runs.
    pub fn stats(&self) -> Arc<DeleteStats> {
        Arc::clone(&self.stats)
    }

    /// Queues a delete of `key`.
    pub fn submit(&mut self, key: u64) -> WaiterId {
        let mut op =
            DeleteOperation::new(Arc::clone(&self.cache), key).with_stats(Arc::clone(&self.stats));
        if let Some(steps) = self.step_budget {
            op = op.with_step_budget(steps);
        }
        let waiter = op.waiter();
        self.running.insert(waiter, op);
        self.ready.push_back(waiter);
        waiter
    }

    /// Number of operations not yet finished.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Cancels the operation running as `waiter`. Returns false if it is unknown.
    pub fn cancel(&mut self, waiter: WaiterId) -> bool {
        let Some(mut op) = self.running.remove(&waiter) else {
            return false;
        };
        op.cancel();
        self.ready.retain(|queued| *queued != waiter);
        self.finished.push(Finished {
            waiter,
            key: op.key(),
            outcome: Err(ArborError::Cancelled),
        });
        true
    }

    /// Performs one unit of work. Returns false when nothing is ready and no
    /// completion is queued.
    pub fn tick(&mut self) -> Result<bool> {
        if let Some(waiter) = self.ready.pop_front() {
            self.step(waiter, None);
            return Ok(true);
        }
        match self.cache.poll_completion()? {
            Some(Completion { waiter, event }) => {
                if self.running.contains_key(&waiter) {
                    self.step(waiter, Some(event));
                } else {
                    warn!(target: "arbor_btree::driver", waiter = waiter.0, ?event, "driver.orphan_completion");
                    if let CompletionEvent::BufferReady { buffer, .. } = event {
                        buffer.release();
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ticks until no work is left. Operations still waiting for admission
    /// (for example behind a held barrier) remain in flight.
    pub fn run_until_idle(&mut self) -> Result<()> {
        while self.tick()? {}
        Ok(())
    }

    /// Drains the operations that finished since the last call.
    pub fn take_finished(&mut self) -> Vec<Finished> {
        std::mem::take(&mut self.finished)
    }

    fn step(&mut self, waiter: WaiterId, event: Option<CompletionEvent>) {
        let Some(op) = self.running.get_mut(&waiter) else {
            return;
        };
        let outcome = match op.resume(event) {
            Ok(Progress::Yielded) => {
                self.ready.push_back(waiter);
                return;
            }
            Ok(Progress::Suspended) => return,
            Ok(Progress::Done) => op
                .result()
                .ok_or(ArborError::Invariant("finished operation has no result")),
            Err(err) => Err(err),
        };
        if let Some(op) = self.running.remove(&waiter) {
            debug!(target: "arbor_btree::driver", waiter = waiter.0, key = op.key(), ok = outcome.is_ok(), "driver.finished");
            self.finished.push(Finished {
                waiter,
                key: op.key(),
                outcome,
            });
        }
    }
}

/// Deletes `key`, driving the operation until it finishes.
///
/// Fails with [`ArborError::Invalid`] if the operation cannot be admitted
/// because nothing will ever complete (for example a barrier is held by the
/// caller).
pub fn delete(cache: Arc<dyn PageCache>, key: u64) -> Result<DeleteResult> {
    let mut driver = DeleteDriver::new(cache);
    let waiter = driver.submit(key);
    driver.run_until_idle()?;
    if driver.in_flight() > 0 {
        driver.cancel(waiter);
        return Err(ArborError::Invalid("delete stalled awaiting admission"));
    }
    driver
        .take_finished()
        .into_iter()
        .find(|finished| finished.waiter == waiter)
        .map(|finished| finished.outcome)
        .unwrap_or(Err(ArborError::Invariant("delete vanished from the driver")))
}
