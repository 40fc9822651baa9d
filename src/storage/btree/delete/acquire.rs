use crate::primitives::pager::{
    AccessMode, Buffer, CompletionEvent, PageCache, Transaction, TxnMode,
};
use crate::storage::btree::page::Node;
use crate::types::{ArborError, PageId, Result, TxnId, WaiterId};

/// Outcome of a request that may resolve later.
pub(super) enum Acquired<T> {
    Ready(T),
    Pending,
}

/// The single request an operation has outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Awaiting {
    Admission,
    Page(PageId),
    Commit(TxnId),
}

/// What a matched completion hands back.
pub(super) enum Delivered {
    Transaction(Transaction),
    Buffer(Buffer),
    Committed,
}

pub(super) fn begin(cache: &dyn PageCache, waiter: WaiterId) -> Result<Acquired<Transaction>> {
    Ok(match cache.begin_transaction(waiter, TxnMode::Write)? {
        Some(txn) => Acquired::Ready(txn),
        None => Acquired::Pending,
    })
}

pub(super) fn acquire(txn: &mut Transaction, page: PageId, mode: AccessMode) -> Result<Acquired<Buffer>> {
    Ok(match txn.acquire(page, mode)? {
        Some(buffer) => Acquired::Ready(buffer),
        None => Acquired::Pending,
    })
}

pub(super) fn commit(txn: &mut Transaction) -> Result<Acquired<()>> {
    Ok(if txn.commit()? {
        Acquired::Ready(())
    } else {
        Acquired::Pending
    })
}

/// Matches `event` against the outstanding request. Anything other than the
/// exact completion expected is a protocol violation; a mismatched buffer is
/// released before the error is returned.
pub(super) fn accept(awaiting: Option<Awaiting>, event: CompletionEvent) -> Result<Delivered> {
    match (awaiting, event) {
        (_, CompletionEvent::Failed(err)) => Err(err),
        (None, event) => {
            discard(event);
            Err(ArborError::Protocol("event delivered while none expected"))
        }
        (Some(Awaiting::Admission), CompletionEvent::TransactionReady(txn)) => {
            Ok(Delivered::Transaction(txn))
        }
        (Some(Awaiting::Page(expected)), CompletionEvent::BufferReady { page, buffer }) => {
            if page != expected || buffer.page_id() != expected {
                buffer.release();
                return Err(ArborError::Protocol("buffer delivered for a different page"));
            }
            Ok(Delivered::Buffer(buffer))
        }
        (Some(Awaiting::Commit(expected)), CompletionEvent::CommitConfirmed(txn)) => {
            if txn != expected {
                return Err(ArborError::Protocol("commit confirmed for another transaction"));
            }
            Ok(Delivered::Committed)
        }
        (Some(_), event) => {
            discard(event);
            Err(ArborError::Protocol("unexpected event kind for the current step"))
        }
    }
}

fn discard(event: CompletionEvent) {
    if let CompletionEvent::BufferReady { buffer, .. } = event {
        buffer.release();
    }
}

/// A pinned node: its buffer paired with the decoded content.
pub(super) struct NodeBuf {
    pub(super) page: PageId,
    pub(super) node: Node,
    buffer: Buffer,
}

impl NodeBuf {
    /// Decodes the node in `buffer`; the buffer is released if decoding fails.
    pub(super) fn load(buffer: Buffer) -> Result<Self> {
        let page = buffer.page_id();
        let decoded = Node::decode(page, &buffer.data());
        match decoded {
            Ok(node) => Ok(Self { page, node, buffer }),
            Err(err) => {
                buffer.release();
                Err(err)
            }
        }
    }

    /// Encodes the node back into its page and marks it dirty.
    pub(super) fn flush(&mut self) -> Result<()> {
        {
            let mut data = self.buffer.data_mut()?;
            self.node.encode(self.page, &mut data)?;
        }
        self.buffer.set_dirty()
    }

    pub(super) fn release(self) {
        self.buffer.release();
    }
}
