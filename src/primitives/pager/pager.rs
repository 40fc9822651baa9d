use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::frame::Frame;
use super::freelist::{read_free_next, write_free_page};
use super::options::PagerOptions;
use super::superblock::{create_superblock, load_superblock, Superblock, SUPERBLOCK_PAGE};
use super::txn::{
    AccessMode, Buffer, CommitWork, Completion, CompletionEvent, Transaction, TxnMode,
};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::{stamp_page, verify_page, ArborError, PageId, Result, TxnId, WaiterId};

/// Contract between the B-tree and the cache/transaction collaborator.
///
/// Every request either resolves immediately or is queued; a queued request
/// is completed later by [`PageCache::poll_completion`], which yields a
/// [`Completion`] addressed to the waiter that issued it.
pub trait PageCache: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> u32;
    /// Allocates a fresh waiter identity for a new operation.
    fn new_waiter(&self) -> WaiterId;
    /// Begins a transaction, or queues the waiter for admission.
    fn begin_transaction(&self, waiter: WaiterId, mode: TxnMode) -> Result<Option<Transaction>>;
    /// Withdraws a queued admission request for `waiter`.
    fn cancel_waiter(&self, waiter: WaiterId);
    /// Completes the oldest queued request.
    fn poll_completion(&self) -> Result<Option<Completion>>;
    /// Block id of the superblock.
    fn superblock_id(&self) -> PageId {
        SUPERBLOCK_PAGE
    }
}

/// Counters describing pager activity since it was opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PagerStats {
    /// Buffers handed out (hits, inline misses, and deferred reads).
    pub acquisitions: u64,
    /// Buffers returned through `release`.
    pub releases: u64,
    /// Buffers dropped without `release`.
    pub leaked_buffers: u64,
    /// Acquisitions served from a resident frame.
    pub cache_hits: u64,
    /// Acquisitions that had to read from the device.
    pub cache_misses: u64,
    /// Misses queued for a later completion.
    pub deferred_reads: u64,
    /// Transactions handed to callers.
    pub transactions_begun: u64,
    /// Transaction requests that had to wait for admission.
    pub deferred_admissions: u64,
    /// Commits that finished.
    pub commits: u64,
    /// Commits queued for a later confirmation.
    pub deferred_commits: u64,
    /// Transactions rolled back.
    pub aborts: u64,
    /// Pages written back to the device.
    pub pages_written: u64,
    /// Pages handed out by `allocate_page`.
    pub pages_allocated: u64,
    /// Pages pushed onto the free chain.
    pub pages_freed: u64,
}

pub(super) enum Request {
    Read {
        waiter: WaiterId,
        txn: TxnId,
        page: PageId,
        mode: AccessMode,
    },
    Admit {
        waiter: WaiterId,
        txn: TxnId,
        mode: TxnMode,
    },
    Commit {
        waiter: WaiterId,
        txn: TxnId,
        work: CommitWork,
    },
}

impl Request {
    fn txn(&self) -> TxnId {
        match self {
            Request::Read { txn, .. } | Request::Admit { txn, .. } | Request::Commit { txn, .. } => {
                *txn
            }
        }
    }
}

pub(super) struct PagerState {
    pub(super) frames: HashMap<PageId, Frame>,
    release_order: VecDeque<PageId>,
    pub(super) pending: VecDeque<Request>,
    admission: VecDeque<(WaiterId, TxnMode)>,
    writer: Option<TxnId>,
    pub(super) outstanding: HashSet<TxnId>,
    barriers: usize,
    next_txn: u64,
    next_waiter: u64,
    pub(super) stats: PagerStats,
}

impl PagerState {
    fn new() -> Self {
        Self {
            frames: HashMap::new(),
            release_order: VecDeque::new(),
            pending: VecDeque::new(),
            admission: VecDeque::new(),
            writer: None,
            outstanding: HashSet::new(),
            barriers: 0,
            next_txn: 1,
            next_waiter: 1,
            stats: PagerStats::default(),
        }
    }

    fn issue_txn(&mut self, mode: TxnMode) -> TxnId {
        let txn = TxnId(self.next_txn);
        self.next_txn += 1;
        if mode == TxnMode::Write {
            self.writer = Some(txn);
        }
        txn
    }
}

pub(super) struct Shared {
    io: Arc<dyn FileIo>,
    pub(super) options: PagerOptions,
    pub(super) page_size: u32,
    salt: u64,
    pub(super) state: Mutex<PagerState>,
}

impl Shared {
    fn page_offset(&self, page: PageId) -> Result<u64> {
        page.0
            .checked_mul(self.page_size as u64)
            .ok_or(ArborError::Invalid("page offset overflow"))
    }

    /// Makes `page` resident, reading it from the device on a miss.
    pub(super) fn load_frame(&self, state: &mut PagerState, page: PageId) -> Result<()> {
        if state.frames.contains_key(&page) {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.page_size as usize].into_boxed_slice();
        self.io.read_at(self.page_offset(page)?, &mut bytes)?;
        if self.options.verify_checksums {
            verify_page(page.0, self.salt, &bytes)?;
        }
        trace!(target: "arbor_pager", page = page.0, "pager.load_frame");
        state.frames.insert(page, Frame::from_bytes(bytes));
        Ok(())
    }

    pub(super) fn read_superblock(&self, state: &mut PagerState) -> Result<Superblock> {
        self.load_frame(state, SUPERBLOCK_PAGE)?;
        let frame = state
            .frames
            .get(&SUPERBLOCK_PAGE)
            .ok_or(ArborError::Invariant("superblock frame missing after load"))?;
        let data = frame.buf.read();
        Superblock::decode(&data)
    }

    pub(super) fn unpin(&self, page: PageId, leaked: bool) {
        let mut state = self.state.lock();
        if leaked {
            state.stats.leaked_buffers += 1;
        } else {
            state.stats.releases += 1;
        }
        let Some(frame) = state.frames.get_mut(&page) else {
            return;
        };
        frame.pin_count = frame.pin_count.saturating_sub(1);
        if frame.is_evictable() {
            state.release_order.push_back(page);
            self.evict_excess(&mut state);
        }
    }

    pub(super) fn mark_dirty(&self, page: PageId) {
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get_mut(&page) {
            frame.dirty = true;
        }
    }

    /// Drops the oldest clean, unpinned frames beyond the cache budget.
    fn evict_excess(&self, state: &mut PagerState) {
        let mut evictable = state.frames.values().filter(|f| f.is_evictable()).count();
        while evictable > self.options.cache_pages {
            let Some(page) = state.release_order.pop_front() else {
                break;
            };
            if state.frames.get(&page).is_some_and(Frame::is_evictable) {
                state.frames.remove(&page);
                evictable -= 1;
            }
        }
    }

    /// Admits queued waiters in FIFO order while no barrier or writer blocks them.
    fn admit_next(&self, state: &mut PagerState) {
        while let Some(&(waiter, mode)) = state.admission.front() {
            if state.barriers > 0 || (mode == TxnMode::Write && state.writer.is_some()) {
                break;
            }
            state.admission.pop_front();
            let txn = state.issue_txn(mode);
            trace!(target: "arbor_pager", waiter = waiter.0, txn = txn.0, "pager.admit");
            state.pending.push_back(Request::Admit { waiter, txn, mode });
        }
    }

    fn finish_writer(&self, state: &mut PagerState, txn: TxnId) {
        if state.writer == Some(txn) {
            state.writer = None;
            self.admit_next(state);
        }
    }

    /// Writes every dirty frame, pushes freed pages onto the free chain, and
    /// applies superblock edits.
    pub(super) fn apply_commit(
        &self,
        state: &mut PagerState,
        txn: TxnId,
        work: CommitWork,
    ) -> Result<()> {
        let freed = work.freed.len();
        if work.touches_superblock() {
            let mut sb = self.read_superblock(state)?;
            if let Some(cursor) = work.alloc {
                sb.next_page = cursor.next_page;
                sb.free_head = cursor.free_head;
                sb.free_pages = cursor.free_pages;
            }
            if let Some(root) = work.root {
                sb.root = root;
            }
            if let Some(geometry) = work.geometry {
                sb.geometry = geometry;
            }
            for page in work.freed {
                if state.frames.get(&page).is_some_and(|f| f.pin_count > 0) {
                    return Err(ArborError::Invariant("freed page is still pinned"));
                }
                let mut bytes = vec![0u8; self.page_size as usize].into_boxed_slice();
                write_free_page(&mut bytes, page, self.page_size, sb.free_head)?;
                let mut frame = Frame::from_bytes(bytes);
                frame.dirty = true;
                state.frames.insert(page, frame);
                sb.free_head = page;
                sb.free_pages += 1;
                state.stats.pages_freed += 1;
            }
            let frame = state
                .frames
                .get_mut(&SUPERBLOCK_PAGE)
                .ok_or(ArborError::Invariant("superblock frame missing at commit"))?;
            sb.encode(&mut frame.buf.write())?;
            frame.dirty = true;
        }

        let mut dirty: Vec<PageId> = state
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty.sort();
        let written = dirty.len();
        for page in dirty {
            let offset = self.page_offset(page)?;
            let frame = state
                .frames
                .get_mut(&page)
                .ok_or(ArborError::Invariant("dirty frame vanished during commit"))?;
            {
                let mut data = frame.buf.write();
                stamp_page(page.0, self.salt, &mut data)?;
                self.io.write_at(offset, &data)?;
            }
            frame.dirty = false;
            if frame.pin_count == 0 {
                state.release_order.push_back(page);
            }
            state.stats.pages_written += 1;
        }
        self.io.sync_all()?;
        state.stats.commits += 1;
        debug!(
            target: "arbor_pager",
            txn = txn.0,
            pages_written = written,
            pages_freed = freed,
            "pager.commit.complete"
        );
        self.finish_writer(state, txn);
        self.evict_excess(state);
        Ok(())
    }

    /// Rolls back `txn`: drops queued requests and, for the writer, every
    /// dirty frame.
    pub(super) fn abort_locked(&self, state: &mut PagerState, txn: TxnId) {
        state.pending.retain(|request| request.txn() != txn);
        state.outstanding.remove(&txn);
        if state.writer == Some(txn) {
            let dirty: Vec<PageId> = state
                .frames
                .iter()
                .filter(|(_, frame)| frame.dirty)
                .map(|(id, _)| *id)
                .collect();
            for page in dirty {
                state.frames.remove(&page);
            }
        }
        state.stats.aborts += 1;
        warn!(target: "arbor_pager", txn = txn.0, "pager.abort");
        self.finish_writer(state, txn);
    }
}

/// Pins `page` (loading it if needed) and wraps it in a buffer.
pub(super) fn checkout(
    shared: &Arc<Shared>,
    state: &mut PagerState,
    page: PageId,
    mode: AccessMode,
) -> Result<Buffer> {
    shared.load_frame(state, page)?;
    let frame = state
        .frames
        .get_mut(&page)
        .ok_or(ArborError::Invariant("frame missing after load"))?;
    frame.pin_count += 1;
    let bytes = Arc::clone(&frame.buf);
    state.stats.acquisitions += 1;
    Ok(Buffer::new(Arc::clone(shared), page, mode, bytes))
}

/// Page cache over a [`FileIo`] device with single-writer transactions.
pub struct Pager {
    shared: Arc<Shared>,
}

impl Pager {
    /// Creates (or truncates) a page file at `path` and formats it.
    pub fn create(path: impl AsRef<Path>, opts: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::format(Arc::new(io), opts)
    }

    /// Opens an existing page file at `path`.
    pub fn open(path: impl AsRef<Path>, opts: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::load(Arc::new(io), opts)
    }

    /// Creates a pager over a fresh in-memory image.
    pub fn in_memory(opts: PagerOptions) -> Result<Self> {
        Self::format(Arc::new(MemFileIo::new()), opts)
    }

    /// Formats `io` with an empty tree.
    pub fn format(io: Arc<dyn FileIo>, opts: PagerOptions) -> Result<Self> {
        let sb = create_superblock(io.as_ref(), opts.page_size, opts.geometry)?;
        debug!(target: "arbor_pager", page_size = sb.page_size, "pager.format");
        Ok(Self::from_superblock(io, opts, &sb))
    }

    /// Opens a previously formatted `io`. The page size recorded in the
    /// superblock overrides `opts.page_size`.
    pub fn load(io: Arc<dyn FileIo>, mut opts: PagerOptions) -> Result<Self> {
        let sb = load_superblock(io.as_ref())?;
        opts.page_size = sb.page_size;
        opts.geometry = sb.geometry;
        Ok(Self::from_superblock(io, opts, &sb))
    }

    fn from_superblock(io: Arc<dyn FileIo>, options: PagerOptions, sb: &Superblock) -> Self {
        Self {
            shared: Arc::new(Shared {
                io,
                page_size: sb.page_size,
                salt: sb.salt,
                options,
                state: Mutex::new(PagerState::new()),
            }),
        }
    }

    /// Returns the options the pager runs with.
    pub fn options(&self) -> &PagerOptions {
        &self.shared.options
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> PagerStats {
        self.shared.state.lock().stats
    }

    /// Number of frames currently pinned by a buffer.
    pub fn pinned_frames(&self) -> usize {
        self.shared
            .state
            .lock()
            .frames
            .values()
            .filter(|f| f.pin_count > 0)
            .count()
    }

    /// Number of resident frames.
    pub fn resident_frames(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Number of queued requests awaiting [`PageCache::poll_completion`].
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Drops every clean, unpinned frame so later acquisitions miss.
    pub fn evict_clean(&self) {
        let mut state = self.shared.state.lock();
        state.frames.retain(|_, frame| !frame.is_evictable());
        state.release_order.clear();
    }

    /// Reads the superblock as the cache currently sees it.
    pub fn superblock(&self) -> Result<Superblock> {
        let mut state = self.shared.state.lock();
        self.shared.read_superblock(&mut state)
    }

    /// Walks the committed free chain from its head.
    pub fn free_pages(&self) -> Result<Vec<PageId>> {
        let mut state = self.shared.state.lock();
        let sb = self.shared.read_superblock(&mut state)?;
        let mut pages = Vec::new();
        let mut next = sb.free_head;
        while !next.is_null() {
            if pages.len() as u64 >= sb.free_pages || pages.contains(&next) {
                return Err(ArborError::Corruption("free chain longer than recorded"));
            }
            self.shared.load_frame(&mut state, next)?;
            let frame = state
                .frames
                .get(&next)
                .ok_or(ArborError::Invariant("free page frame missing after load"))?;
            let link = read_free_next(&frame.buf.read(), next)?;
            pages.push(next);
            next = link;
        }
        Ok(pages)
    }

    /// Blocks admission of new transactions until the guard drops.
    pub fn hold_barrier(&self) -> Barrier {
        self.shared.state.lock().barriers += 1;
        Barrier {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Begins a transaction without queueing; fails if admission would have
    /// to wait. Used by setup and verification tools.
    pub fn begin_blocking(&self, mode: TxnMode) -> Result<Transaction> {
        let waiter = self.new_waiter();
        let mut state = self.shared.state.lock();
        if !admits_now(&state, mode) {
            return Err(ArborError::Invalid("pager busy: transaction cannot be admitted"));
        }
        let txn = state.issue_txn(mode);
        state.stats.transactions_begun += 1;
        drop(state);
        Ok(Transaction::new(Arc::clone(&self.shared), txn, mode, waiter))
    }
}

fn admits_now(state: &PagerState, mode: TxnMode) -> bool {
    state.barriers == 0
        && state.admission.is_empty()
        && !(mode == TxnMode::Write && state.writer.is_some())
}

impl PageCache for Pager {
    fn page_size(&self) -> u32 {
        self.shared.page_size
    }

    fn new_waiter(&self) -> WaiterId {
        let mut state = self.shared.state.lock();
        let waiter = WaiterId(state.next_waiter);
        state.next_waiter += 1;
        waiter
    }

    fn begin_transaction(&self, waiter: WaiterId, mode: TxnMode) -> Result<Option<Transaction>> {
        let mut state = self.shared.state.lock();
        if !admits_now(&state, mode) {
            state.admission.push_back((waiter, mode));
            state.stats.deferred_admissions += 1;
            trace!(target: "arbor_pager", waiter = waiter.0, "pager.begin.deferred");
            return Ok(None);
        }
        let txn = state.issue_txn(mode);
        state.stats.transactions_begun += 1;
        drop(state);
        Ok(Some(Transaction::new(
            Arc::clone(&self.shared),
            txn,
            mode,
            waiter,
        )))
    }

    fn cancel_waiter(&self, waiter: WaiterId) {
        let mut state = self.shared.state.lock();
        state.admission.retain(|(queued, _)| *queued != waiter);
        let mut admitted = Vec::new();
        state.pending.retain(|request| match request {
            Request::Admit {
                waiter: queued,
                txn,
                ..
            } if *queued == waiter => {
                admitted.push(*txn);
                false
            }
            _ => true,
        });
        for txn in admitted {
            self.shared.finish_writer(&mut state, txn);
        }
    }

    fn poll_completion(&self) -> Result<Option<Completion>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let Some(request) = state.pending.pop_front() else {
            return Ok(None);
        };
        let completion = match request {
            Request::Read {
                waiter,
                txn,
                page,
                mode,
            } => {
                state.outstanding.remove(&txn);
                let event = match checkout(shared, &mut state, page, mode) {
                    Ok(buffer) => CompletionEvent::BufferReady { page, buffer },
                    Err(err) => CompletionEvent::Failed(err),
                };
                Completion { waiter, event }
            }
            Request::Admit { waiter, txn, mode } => {
                state.stats.transactions_begun += 1;
                Completion {
                    waiter,
                    event: CompletionEvent::TransactionReady(Transaction::new(
                        Arc::clone(shared),
                        txn,
                        mode,
                        waiter,
                    )),
                }
            }
            Request::Commit { waiter, txn, work } => {
                state.outstanding.remove(&txn);
                let event = match shared.apply_commit(&mut state, txn, work) {
                    Ok(()) => CompletionEvent::CommitConfirmed(txn),
                    Err(err) => {
                        shared.abort_locked(&mut state, txn);
                        CompletionEvent::Failed(err)
                    }
                };
                Completion { waiter, event }
            }
        };
        Ok(Some(completion))
    }
}

/// Guard that holds the admission barrier; new transactions queue until it drops.
pub struct Barrier {
    shared: Arc<Shared>,
}

impl Drop for Barrier {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.barriers = state.barriers.saturating_sub(1);
        self.shared.admit_next(&mut state);
    }
}
