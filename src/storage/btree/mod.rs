#![forbid(unsafe_code)]

//! Disk-backed B-tree with resumable deletion.

/// Node encoding within a page.
pub mod page;

/// Node-level primitives used by the rebalance policy.
pub mod node;

pub mod builder;
pub mod delete;
pub mod driver;
mod stats;
pub mod verify;

pub use builder::{spec_value, TreeBuilder, TreeSpec};
pub use delete::{DeleteOperation, DeleteResult, DeleteStep, Progress, Rebalance};
pub use driver::{delete, DeleteDriver, Finished};
pub use node::{Side, Sibling};
pub use page::{InternalNode, LeafNode, Node};
pub use stats::{DeleteStats, DeleteStatsSnapshot};
pub use verify::{collect_entries, verify_tree, VerifyReport};
