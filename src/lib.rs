//! Arbor: a disk-backed B-tree whose deletes run as resumable state machines.
//!
//! Deletion never blocks. A [`storage::btree::DeleteOperation`] asks the
//! [`primitives::pager::PageCache`] for a transaction and then for each page
//! on the root-to-leaf path; when the cache cannot answer inline the
//! operation suspends and is resumed with the completion event later.
//! Underfull nodes are collapsed, merged, or leveled on the way down.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
