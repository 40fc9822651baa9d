//! Resumable key deletion.
//!
//! A [`DeleteOperation`] removes one key from the tree, rebalancing every
//! underfull node it passes on the way down so the leaf can lose an entry
//! without breaking the occupancy bound. It never blocks: whenever the page
//! cache cannot hand back a transaction, a buffer, or a commit inline, the
//! operation records what it is waiting for and returns
//! [`Progress::Suspended`]. The caller feeds the matching
//! [`CompletionEvent`] back through [`DeleteOperation::resume`].

mod acquire;
mod rebalance;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace};

use self::acquire::{Acquired, Awaiting, Delivered, NodeBuf};
pub use self::rebalance::{decide, Rebalance};
use super::node::Sibling;
use super::stats::DeleteStats;
use crate::primitives::pager::{AccessMode, Buffer, CompletionEvent, PageCache, Superblock, Transaction};
use crate::types::{ArborError, Geometry, PageId, Result, WaiterId};

/// Steps of a delete, in the order they are entered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum DeleteStep {
    /// Waiting for a write transaction.
    StartTransaction,
    /// Reading the root pointer and geometry.
    AcquireSuperblock,
    /// Pinning the root.
    AcquireRoot,
    /// Pinning and processing the node selected by the descent.
    AcquireNode,
    /// Pinning the sibling of an underfull node.
    AcquireSibling,
    /// Descent finished; commit not yet issued.
    DeleteComplete,
    /// Commit issued, awaiting confirmation.
    Committing,
    /// Terminal.
    Done,
}

/// What a call to [`DeleteOperation::resume`] achieved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    /// The step budget ran out with nothing outstanding; resume with no event.
    Yielded,
    /// A request is outstanding; resume with its completion.
    Suspended,
    /// The operation finished and holds nothing.
    Done,
}

/// Outcome of a finished delete.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteResult {
    /// The key was present and has been removed.
    Found,
    /// The key was not in the tree.
    NotFound,
}

enum Flow {
    Continue,
    Suspend,
}

/// One key deletion driven by repeated calls to [`DeleteOperation::resume`].
pub struct DeleteOperation {
    key: u64,
    cache: Arc<dyn PageCache>,
    waiter: WaiterId,
    step: DeleteStep,
    txn: Option<Transaction>,
    geometry: Option<Geometry>,
    root: PageId,
    node_id: PageId,
    current: Option<NodeBuf>,
    parent: Option<NodeBuf>,
    sibling: Option<(NodeBuf, Sibling)>,
    link: Option<Sibling>,
    staged: Option<Buffer>,
    rebalanced: bool,
    awaiting: Option<Awaiting>,
    result: Option<DeleteResult>,
    failed: bool,
    step_budget: Option<usize>,
    stats: Option<Arc<DeleteStats>>,
}

impl DeleteOperation {
    /// Creates an operation that deletes `key` through `cache`.
    pub fn new(cache: Arc<dyn PageCache>, key: u64) -> Self {
        let waiter = cache.new_waiter();
        Self {
            key,
            cache,
            waiter,
            step: DeleteStep::StartTransaction,
            txn: None,
            geometry: None,
            root: PageId::NULL,
            node_id: PageId::NULL,
            current: None,
            parent: None,
            sibling: None,
            link: None,
            staged: None,
            rebalanced: false,
            awaiting: None,
            result: None,
            failed: false,
            step_budget: None,
            stats: None,
        }
    }

    /// Limits how many steps one call to `resume` may run before yielding.
    pub fn with_step_budget(mut self, steps: usize) -> Self {
        self.step_budget = Some(steps.max(1));
        self
    }

    /// Records counters into `stats`.
    pub fn with_stats(mut self, stats: Arc<DeleteStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Key being deleted.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Identity completions for this operation are addressed to.
    pub fn waiter(&self) -> WaiterId {
        self.waiter
    }

    /// Current step.
    pub fn step(&self) -> DeleteStep {
        self.step
    }

    /// Outcome, once the operation is done.
    pub fn result(&self) -> Option<DeleteResult> {
        if self.step == DeleteStep::Done {
            self.result
        } else {
            None
        }
    }

    /// Whether the operation reached a terminal state (done, failed, or cancelled).
    pub fn is_finished(&self) -> bool {
        self.step == DeleteStep::Done || self.failed
    }

    /// Whether a request is outstanding.
    pub fn is_suspended(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Advances the operation.
    ///
    /// Pass `None` on the first call and after [`Progress::Yielded`]; pass
    /// the delivered completion after [`Progress::Suspended`]. Any error is
    /// terminal: held buffers are released, the transaction is aborted, and
    /// later calls return [`ArborError::Protocol`].
    pub fn resume(&mut self, event: Option<CompletionEvent>) -> Result<Progress> {
        if self.failed {
            return Err(ArborError::Protocol("resume on a failed operation"));
        }
        if self.step == DeleteStep::Done {
            return Err(ArborError::Protocol("resume on a finished operation"));
        }
        match self.drive(event) {
            Ok(progress) => Ok(progress),
            Err(err) => {
                error!(
                    target: "arbor_btree::delete",
                    key = self.key,
                    step = ?self.step,
                    error = %err,
                    "delete.failed"
                );
                self.teardown();
                if let Some(stats) = &self.stats {
                    stats.inc_failed();
                }
                Err(err)
            }
        }
    }

    /// Abandons the operation: releases every held buffer and aborts the
    /// transaction or withdraws the pending admission request. A commit
    /// already handed to the pager is not recalled.
    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        debug!(target: "arbor_btree::delete", key = self.key, step = ?self.step, "delete.cancel");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.failed = true;
        if self.awaiting.take() == Some(Awaiting::Admission) {
            self.cache.cancel_waiter(self.waiter);
        }
        self.release_all();
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
    }

    fn release_all(&mut self) {
        if let Some(buffer) = self.staged.take() {
            buffer.release();
        }
        if let Some((sibling, _)) = self.sibling.take() {
            sibling.release();
        }
        if let Some(current) = self.current.take() {
            current.release();
        }
        if let Some(parent) = self.parent.take() {
            parent.release();
        }
    }

    fn drive(&mut self, event: Option<CompletionEvent>) -> Result<Progress> {
        match (event, self.awaiting.take()) {
            (Some(event), awaiting) => self.deliver(awaiting, event)?,
            (None, Some(awaiting)) => {
                self.awaiting = Some(awaiting);
                return Err(ArborError::Protocol("resumed without the awaited completion"));
            }
            (None, None) => {}
        }
        let mut budget = self.step_budget;
        loop {
            if self.step == DeleteStep::Done {
                return Ok(Progress::Done);
            }
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Ok(Progress::Yielded);
                }
                *left -= 1;
            }
            match self.run_step()? {
                Flow::Continue => {}
                Flow::Suspend => {
                    trace!(
                        target: "arbor_btree::delete",
                        key = self.key,
                        step = ?self.step,
                        awaiting = ?self.awaiting,
                        "delete.suspend"
                    );
                    if let Some(stats) = &self.stats {
                        stats.inc_suspensions();
                    }
                    return Ok(Progress::Suspended);
                }
            }
        }
    }

    fn deliver(&mut self, awaiting: Option<Awaiting>, event: CompletionEvent) -> Result<()> {
        match acquire::accept(awaiting, event)? {
            Delivered::Transaction(txn) => {
                self.expect_step(DeleteStep::StartTransaction)?;
                self.txn = Some(txn);
                self.advance(DeleteStep::AcquireSuperblock)
            }
            Delivered::Buffer(buffer) => {
                if self.staged.is_some() {
                    buffer.release();
                    return Err(ArborError::Invariant("a delivered buffer is already staged"));
                }
                self.staged = Some(buffer);
                Ok(())
            }
            Delivered::Committed => {
                self.expect_step(DeleteStep::Committing)?;
                self.txn = None;
                self.finish()
            }
        }
    }

    fn run_step(&mut self) -> Result<Flow> {
        match self.step {
            DeleteStep::StartTransaction => {
                match acquire::begin(self.cache.as_ref(), self.waiter)? {
                    Acquired::Ready(txn) => {
                        self.txn = Some(txn);
                        self.advance(DeleteStep::AcquireSuperblock)?;
                        Ok(Flow::Continue)
                    }
                    Acquired::Pending => {
                        self.awaiting = Some(Awaiting::Admission);
                        Ok(Flow::Suspend)
                    }
                }
            }
            DeleteStep::AcquireSuperblock => {
                let page = self.cache.superblock_id();
                let Some(buffer) = self.fetch(page, AccessMode::Read)? else {
                    return Ok(Flow::Suspend);
                };
                let decoded = Superblock::decode(&buffer.data());
                buffer.release();
                let superblock = decoded?;
                self.geometry = Some(superblock.geometry);
                self.root = superblock.root;
                self.advance(DeleteStep::AcquireRoot)?;
                Ok(Flow::Continue)
            }
            DeleteStep::AcquireRoot => {
                if self.root.is_null() {
                    self.result = Some(DeleteResult::NotFound);
                    self.advance(DeleteStep::DeleteComplete)?;
                    return Ok(Flow::Continue);
                }
                self.node_id = self.root;
                let Some(buffer) = self.fetch(self.root, AccessMode::Write)? else {
                    return Ok(Flow::Suspend);
                };
                self.hold(buffer)?;
                self.advance(DeleteStep::AcquireNode)?;
                Ok(Flow::Continue)
            }
            DeleteStep::AcquireNode => {
                if self.current.is_none() {
                    let Some(buffer) = self.fetch(self.node_id, AccessMode::Write)? else {
                        return Ok(Flow::Suspend);
                    };
                    self.hold(buffer)?;
                }
                self.process_node()
            }
            DeleteStep::AcquireSibling => {
                let link = match self.link {
                    Some(link) => link,
                    None => {
                        let parent = self
                            .parent
                            .as_ref()
                            .ok_or(ArborError::Invariant("sibling requested without a parent"))?;
                        let link = parent.node.sibling(self.key)?;
                        if link.node != self.node_id {
                            return Err(ArborError::Invariant(
                                "parent no longer routes the key to the held node",
                            ));
                        }
                        self.link = Some(link);
                        link
                    }
                };
                let Some(buffer) = self.fetch(link.page, AccessMode::Write)? else {
                    return Ok(Flow::Suspend);
                };
                self.link = None;
                self.sibling = Some((NodeBuf::load(buffer)?, link));
                self.advance(DeleteStep::AcquireNode)?;
                Ok(Flow::Continue)
            }
            DeleteStep::DeleteComplete => {
                self.check_invariants()?;
                if self.result.is_none() {
                    return Err(ArborError::Invariant("delete completed without a result"));
                }
                self.advance(DeleteStep::Committing)?;
                let txn = self
                    .txn
                    .as_mut()
                    .ok_or(ArborError::Invariant("commit without a transaction"))?;
                let id = txn.id();
                match acquire::commit(txn)? {
                    Acquired::Ready(()) => {
                        self.txn = None;
                        self.finish()?;
                        Ok(Flow::Continue)
                    }
                    Acquired::Pending => {
                        self.awaiting = Some(Awaiting::Commit(id));
                        Ok(Flow::Suspend)
                    }
                }
            }
            DeleteStep::Committing => Err(ArborError::Invariant(
                "committing with no confirmation outstanding",
            )),
            DeleteStep::Done => Ok(Flow::Continue),
        }
    }

    /// Runs the per-node loop on `current`: rebalance if needed, then either
    /// finish at the leaf or step down one level.
    fn process_node(&mut self) -> Result<Flow> {
        let geometry = self.geometry()?;
        let current = self
            .current
            .as_ref()
            .ok_or(ArborError::Invariant("node step without a held node"))?;
        if self.parent.is_some() && !self.rebalanced && current.node.is_underfull(&geometry) {
            if self.sibling.is_none() {
                self.advance(DeleteStep::AcquireSibling)?;
                return Ok(Flow::Continue);
            }
            let txn = self
                .txn
                .as_mut()
                .ok_or(ArborError::Invariant("rebalance without a transaction"))?;
            let leaf = current.node.is_leaf();
            let action = rebalance::apply(
                txn,
                &mut self.current,
                &mut self.parent,
                &mut self.sibling,
                &geometry,
            )?;
            self.rebalanced = true;
            if action == Rebalance::Collapse {
                self.node_id = self
                    .current
                    .as_ref()
                    .map(|node| node.page)
                    .ok_or(ArborError::Invariant("collapse left no current node"))?;
            }
            self.record(action, leaf);
        }
        self.check_invariants()?;

        let current = self
            .current
            .as_ref()
            .ok_or(ArborError::Invariant("node step without a held node"))?;
        if current.node.is_leaf() {
            let Some(mut leaf) = self.current.take() else {
                return Err(ArborError::Invariant("node step without a held node"));
            };
            let removed = leaf.node.remove(self.key);
            let flushed = match removed {
                Ok(true) => leaf.flush().map(|()| true),
                other => other,
            };
            leaf.release();
            if let Some(parent) = self.parent.take() {
                parent.release();
            }
            let found = flushed?;
            self.result = Some(if found {
                DeleteResult::Found
            } else {
                DeleteResult::NotFound
            });
            trace!(target: "arbor_btree::delete", key = self.key, found, "delete.leaf");
            self.advance(DeleteStep::DeleteComplete)?;
            return Ok(Flow::Continue);
        }

        let next = current.node.lookup(self.key)?;
        if let Some(parent) = self.parent.take() {
            parent.release();
        }
        self.parent = self.current.take();
        self.node_id = next;
        self.rebalanced = false;
        trace!(target: "arbor_btree::delete", key = self.key, next = next.0, "delete.descend");
        Ok(Flow::Continue)
    }

    /// Takes the staged buffer for `page` or asks the transaction for it.
    fn fetch(&mut self, page: PageId, mode: AccessMode) -> Result<Option<Buffer>> {
        if let Some(buffer) = self.staged.take() {
            if buffer.page_id() != page {
                buffer.release();
                return Err(ArborError::Protocol("staged buffer is for a different page"));
            }
            return Ok(Some(buffer));
        }
        if self.current.is_some() && self.step != DeleteStep::AcquireSibling {
            return Err(ArborError::Invariant(
                "acquisition issued while a node is still held",
            ));
        }
        let txn = self
            .txn
            .as_mut()
            .ok_or(ArborError::Invariant("acquisition without a transaction"))?;
        match acquire::acquire(txn, page, mode)? {
            Acquired::Ready(buffer) => Ok(Some(buffer)),
            Acquired::Pending => {
                self.awaiting = Some(Awaiting::Page(page));
                Ok(None)
            }
        }
    }

    fn hold(&mut self, buffer: Buffer) -> Result<()> {
        if buffer.page_id() != self.node_id {
            buffer.release();
            return Err(ArborError::Invariant("held buffer is not the selected node"));
        }
        self.current = Some(NodeBuf::load(buffer)?);
        self.rebalanced = false;
        if let Some(stats) = &self.stats {
            stats.inc_nodes_visited();
        }
        Ok(())
    }

    fn geometry(&self) -> Result<Geometry> {
        self.geometry
            .ok_or(ArborError::Invariant("geometry read before the superblock"))
    }

    fn expect_step(&self, step: DeleteStep) -> Result<()> {
        if self.step != step {
            return Err(ArborError::Protocol("completion does not match the current step"));
        }
        Ok(())
    }

    /// Moves to `next`; only `AcquireSibling -> AcquireNode` may go back.
    fn advance(&mut self, next: DeleteStep) -> Result<()> {
        let back_to_node =
            self.step == DeleteStep::AcquireSibling && next == DeleteStep::AcquireNode;
        if next < self.step && !back_to_node {
            return Err(ArborError::Invariant("delete step moved backward"));
        }
        trace!(
            target: "arbor_btree::delete",
            key = self.key,
            from = ?self.step,
            to = ?next,
            "delete.transition"
        );
        self.step = next;
        Ok(())
    }

    fn check_invariants(&self) -> Result<()> {
        if self.txn.is_none() && self.step < DeleteStep::Done {
            return Err(ArborError::Invariant("no transaction during the descent"));
        }
        if self.staged.is_some() {
            return Err(ArborError::Invariant("unconsumed buffer at a step boundary"));
        }
        if self.sibling.is_some() {
            return Err(ArborError::Invariant("sibling retained past its rebalance"));
        }
        if self.current.is_some() && self.awaiting == Some(Awaiting::Page(self.node_id)) {
            return Err(ArborError::Invariant("node held while an acquisition is pending"));
        }
        match self.step {
            DeleteStep::AcquireNode => {
                if let Some(current) = &self.current {
                    if current.page != self.node_id {
                        return Err(ArborError::Invariant("held node is not the selected node"));
                    }
                }
                Ok(())
            }
            DeleteStep::DeleteComplete => {
                if self.current.is_some() || self.parent.is_some() {
                    return Err(ArborError::Invariant("buffers held after the leaf finished"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.current.is_some() || self.parent.is_some() || self.sibling.is_some() {
            return Err(ArborError::Invariant("buffers held at finish"));
        }
        self.advance(DeleteStep::Done)?;
        let found = self.result == Some(DeleteResult::Found);
        if let Some(stats) = &self.stats {
            stats.inc_operations();
            if found {
                stats.inc_found();
            } else {
                stats.inc_not_found();
            }
        }
        debug!(target: "arbor_btree::delete", key = self.key, found, "delete.done");
        Ok(())
    }

    fn record(&self, action: Rebalance, leaf: bool) {
        if let Some(stats) = &self.stats {
            match action {
                Rebalance::Collapse => stats.inc_collapses(),
                Rebalance::Merge => stats.inc_merges(leaf),
                Rebalance::Level => stats.inc_levels(leaf),
            }
        }
    }
}

impl Drop for DeleteOperation {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.teardown();
        }
    }
}

impl fmt::Debug for DeleteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteOperation")
            .field("key", &self.key)
            .field("waiter", &self.waiter)
            .field("step", &self.step)
            .field("node_id", &self.node_id)
            .field("awaiting", &self.awaiting)
            .field("result", &self.result)
            .field("failed", &self.failed)
            .finish()
    }
}
