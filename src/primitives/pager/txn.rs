use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{trace, warn};

use super::frame::{Frame, PageBytes};
use super::freelist::read_free_next;
use super::options::{CommitMode, IoMode};
use super::pager::{checkout, Request, Shared};
use super::superblock::SUPERBLOCK_PAGE;
use crate::types::{ArborError, Geometry, PageId, Result, TxnId, WaiterId};

/// Access requested when acquiring a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// Shared access; the page may not be modified.
    Read,
    /// Exclusive access; the page may be modified and marked dirty.
    Write,
}

/// Kind of transaction requested from the pager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnMode {
    /// Read-only; may run beside the writer.
    Read,
    /// Read-write; at most one is active at a time.
    Write,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TxnState {
    Active,
    CommitPending,
    Committed,
    Aborted,
}

#[derive(Clone, Copy, Debug)]
pub(super) struct AllocCursor {
    pub(super) next_page: PageId,
    pub(super) free_head: PageId,
    pub(super) free_pages: u64,
}

/// Superblock edits and frees staged by a write transaction.
#[derive(Debug, Default)]
pub(super) struct CommitWork {
    pub(super) freed: Vec<PageId>,
    pub(super) root: Option<PageId>,
    pub(super) geometry: Option<Geometry>,
    pub(super) alloc: Option<AllocCursor>,
}

impl CommitWork {
    pub(super) fn touches_superblock(&self) -> bool {
        !self.freed.is_empty()
            || self.root.is_some()
            || self.geometry.is_some()
            || self.alloc.is_some()
    }
}

/// A transaction handle. Dropping an active transaction aborts it.
pub struct Transaction {
    id: TxnId,
    mode: TxnMode,
    waiter: WaiterId,
    shared: Arc<Shared>,
    state: TxnState,
    work: CommitWork,
}

impl Transaction {
    pub(super) fn new(shared: Arc<Shared>, id: TxnId, mode: TxnMode, waiter: WaiterId) -> Self {
        trace!(target: "arbor_pager", txn = id.0, ?mode, "pager.txn.begin");
        Self {
            id,
            mode,
            waiter,
            shared,
            state: TxnState::Active,
            work: CommitWork::default(),
        }
    }

    /// Transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Read or write.
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Waiter that completions for this transaction are addressed to.
    pub fn waiter(&self) -> WaiterId {
        self.waiter
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::CommitPending => Err(ArborError::Protocol("transaction commit already issued")),
            TxnState::Committed => Err(ArborError::Protocol("transaction already committed")),
            TxnState::Aborted => Err(ArborError::Protocol("transaction aborted")),
        }
    }

    fn ensure_writer(&self) -> Result<()> {
        self.ensure_active()?;
        if self.mode != TxnMode::Write {
            return Err(ArborError::Invalid("write requested in a read transaction"));
        }
        Ok(())
    }

    /// Acquires `page`. Returns `None` when the read was queued; the buffer
    /// then arrives as [`CompletionEvent::BufferReady`].
    pub fn acquire(&mut self, page: PageId, mode: AccessMode) -> Result<Option<Buffer>> {
        self.ensure_active()?;
        if mode == AccessMode::Write && self.mode != TxnMode::Write {
            return Err(ArborError::Invalid("write access in a read transaction"));
        }
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        if state.outstanding.contains(&self.id) {
            return Err(ArborError::Protocol(
                "transaction already has an outstanding request",
            ));
        }
        if state.frames.contains_key(&page) {
            state.stats.cache_hits += 1;
            return checkout(&shared, &mut state, page, mode).map(Some);
        }
        state.stats.cache_misses += 1;
        match shared.options.io_mode {
            IoMode::Immediate => checkout(&shared, &mut state, page, mode).map(Some),
            IoMode::Deferred => {
                state.pending.push_back(Request::Read {
                    waiter: self.waiter,
                    txn: self.id,
                    page,
                    mode,
                });
                state.outstanding.insert(self.id);
                state.stats.deferred_reads += 1;
                trace!(target: "arbor_pager", txn = self.id.0, page = page.0, "pager.acquire.deferred");
                Ok(None)
            }
        }
    }

    /// Acquires `page`, reading it inline regardless of the I/O mode.
    pub fn acquire_blocking(&mut self, page: PageId, mode: AccessMode) -> Result<Buffer> {
        self.ensure_active()?;
        if mode == AccessMode::Write && self.mode != TxnMode::Write {
            return Err(ArborError::Invalid("write access in a read transaction"));
        }
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        if state.outstanding.contains(&self.id) {
            return Err(ArborError::Protocol(
                "transaction already has an outstanding request",
            ));
        }
        if state.frames.contains_key(&page) {
            state.stats.cache_hits += 1;
        } else {
            state.stats.cache_misses += 1;
        }
        checkout(&shared, &mut state, page, mode)
    }

    /// Allocates a zeroed page, reusing the free chain before extending the file.
    pub fn allocate_page(&mut self) -> Result<Buffer> {
        self.ensure_writer()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let mut cursor = match self.work.alloc {
            Some(cursor) => cursor,
            None => {
                let sb = shared.read_superblock(&mut state)?;
                AllocCursor {
                    next_page: sb.next_page,
                    free_head: sb.free_head,
                    free_pages: sb.free_pages,
                }
            }
        };
        let page = if cursor.free_head.is_null() {
            let page = cursor.next_page;
            cursor.next_page = PageId(page.0 + 1);
            page
        } else {
            let head = cursor.free_head;
            shared.load_frame(&mut state, head)?;
            let next = {
                let frame = state
                    .frames
                    .get(&head)
                    .ok_or(ArborError::Invariant("free page frame missing after load"))?;
                let data = frame.buf.read();
                read_free_next(&data, head)?
            };
            cursor.free_head = next;
            cursor.free_pages = cursor.free_pages.saturating_sub(1);
            head
        };
        if state.frames.get(&page).is_some_and(|f| f.pin_count > 0) {
            return Err(ArborError::Invariant("allocated page is still pinned"));
        }
        self.work.alloc = Some(cursor);
        let mut frame = Frame::zeroed(shared.page_size as usize);
        frame.dirty = true;
        state.frames.insert(page, frame);
        state.stats.pages_allocated += 1;
        trace!(target: "arbor_pager", txn = self.id.0, page = page.0, "pager.allocate");
        checkout(&shared, &mut state, page, AccessMode::Write)
    }

    /// Schedules `page` for the free chain at commit.
    pub fn free_page(&mut self, page: PageId) -> Result<()> {
        self.ensure_writer()?;
        if page == SUPERBLOCK_PAGE {
            return Err(ArborError::Invalid("cannot free the superblock"));
        }
        if self.work.freed.contains(&page) {
            return Err(ArborError::Invariant("page freed twice"));
        }
        self.work.freed.push(page);
        Ok(())
    }

    /// Records a new tree root to publish at commit.
    pub fn set_root(&mut self, root: PageId) -> Result<()> {
        self.ensure_writer()?;
        self.work.root = Some(root);
        Ok(())
    }

    /// Records a new tree geometry to publish at commit.
    pub fn set_geometry(&mut self, geometry: Geometry) -> Result<()> {
        self.ensure_writer()?;
        geometry.validate(self.shared.page_size)?;
        self.work.geometry = Some(geometry);
        Ok(())
    }

    /// Commits the transaction. Returns `true` if the commit finished
    /// inline and `false` if confirmation will arrive as
    /// [`CompletionEvent::CommitConfirmed`].
    pub fn commit(&mut self) -> Result<bool> {
        self.ensure_active()?;
        let deferred = self.mode == TxnMode::Write
            && self.shared.options.commit_mode == CommitMode::Deferred;
        if !deferred {
            self.commit_inline()?;
            return Ok(true);
        }
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        if state.outstanding.contains(&self.id) {
            return Err(ArborError::Protocol(
                "transaction already has an outstanding request",
            ));
        }
        let work = std::mem::take(&mut self.work);
        state.pending.push_back(Request::Commit {
            waiter: self.waiter,
            txn: self.id,
            work,
        });
        state.outstanding.insert(self.id);
        state.stats.deferred_commits += 1;
        self.state = TxnState::CommitPending;
        Ok(false)
    }

    /// Commits inline regardless of the configured commit mode.
    pub fn commit_blocking(mut self) -> Result<()> {
        self.ensure_active()?;
        self.commit_inline()
    }

    fn commit_inline(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        if state.outstanding.contains(&self.id) {
            return Err(ArborError::Protocol(
                "transaction already has an outstanding request",
            ));
        }
        if self.mode == TxnMode::Read {
            self.state = TxnState::Committed;
            state.stats.commits += 1;
            return Ok(());
        }
        let work = std::mem::take(&mut self.work);
        match shared.apply_commit(&mut state, self.id, work) {
            Ok(()) => {
                self.state = TxnState::Committed;
                Ok(())
            }
            Err(err) => {
                shared.abort_locked(&mut state, self.id);
                self.state = TxnState::Aborted;
                Err(err)
            }
        }
    }

    /// Rolls the transaction back.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        let mut state = self.shared.state.lock();
        self.shared.abort_locked(&mut state, self.id);
        self.state = TxnState::Aborted;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

/// A pinned page. Must be handed back with [`Buffer::release`].
pub struct Buffer {
    page: PageId,
    mode: AccessMode,
    bytes: PageBytes,
    shared: Arc<Shared>,
    released: bool,
}

impl Buffer {
    pub(super) fn new(shared: Arc<Shared>, page: PageId, mode: AccessMode, bytes: PageBytes) -> Self {
        Self {
            page,
            mode,
            bytes,
            shared,
            released: false,
        }
    }

    /// Page this buffer pins.
    pub fn page_id(&self) -> PageId {
        self.page
    }

    /// Access granted at acquisition.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Shared view of the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.bytes.read()
    }

    /// Mutable view of the page bytes; requires write access.
    pub fn data_mut(&mut self) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
        if self.mode != AccessMode::Write {
            return Err(ArborError::Invalid("buffer acquired for read"));
        }
        Ok(self.bytes.write())
    }

    /// Marks the page for write-back at commit.
    pub fn set_dirty(&mut self) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(ArborError::Invalid("buffer acquired for read"));
        }
        self.shared.mark_dirty(self.page);
        Ok(())
    }

    /// Unpins the page.
    pub fn release(mut self) {
        self.released = true;
        self.shared.unpin(self.page, false);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.released {
            warn!(target: "arbor_pager", page = self.page.0, "pager.buffer.leaked");
            self.shared.unpin(self.page, true);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("page", &self.page)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Payload of a [`Completion`].
pub enum CompletionEvent {
    /// A queued read finished; the buffer is pinned.
    BufferReady {
        /// Page that was read.
        page: PageId,
        /// Pinned buffer.
        buffer: Buffer,
    },
    /// A queued transaction was admitted.
    TransactionReady(Transaction),
    /// A queued commit finished.
    CommitConfirmed(TxnId),
    /// A queued request failed; a failed commit has already been rolled back.
    Failed(ArborError),
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionEvent::BufferReady { page, .. } => {
                f.debug_struct("BufferReady").field("page", page).finish()
            }
            CompletionEvent::TransactionReady(txn) => {
                f.debug_tuple("TransactionReady").field(&txn.id()).finish()
            }
            CompletionEvent::CommitConfirmed(txn) => {
                f.debug_tuple("CommitConfirmed").field(txn).finish()
            }
            CompletionEvent::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// A completed request addressed to the waiter that issued it.
#[derive(Debug)]
pub struct Completion {
    /// Waiter the event belongs to.
    pub waiter: WaiterId,
    /// What completed.
    pub event: CompletionEvent,
}
