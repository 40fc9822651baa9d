//! Tree storage built on the pager.

/// B-tree node format, deletion state machine, and tree tooling.
pub mod btree;
