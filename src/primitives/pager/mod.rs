#![forbid(unsafe_code)]

mod frame;
mod freelist;
mod options;
#[allow(clippy::module_inception)]
mod pager;
mod superblock;
mod txn;

pub use options::{CommitMode, IoMode, PagerOptions};
pub use pager::{Barrier, PageCache, Pager, PagerStats};
pub use superblock::{Superblock, SUPERBLOCK_PAGE};
pub use txn::{AccessMode, Buffer, Completion, CompletionEvent, Transaction, TxnMode};
