//! Low-level primitives the tree is built on.
//!
//! Positioned block I/O and the page cache with its transaction and
//! completion protocol.

/// I/O abstractions over files and in-memory images.
pub mod io;

/// Page cache, transactions, and deferred completions.
///
/// Manages page frames, the superblock, the free chain, and single-writer
/// admission.
pub mod pager;
