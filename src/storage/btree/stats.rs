use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of delete statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteStatsSnapshot {
    /// Delete operations that finished (found or not).
    pub operations: u64,
    /// Deletes that removed an entry.
    pub found: u64,
    /// Deletes whose key was absent.
    pub not_found: u64,
    /// Deletes that failed and were rolled back.
    pub failed: u64,
    /// Times an operation suspended awaiting a completion
    pub suspensions: u64,
    /// Nodes acquired while descending
    pub nodes_visited: u64,
    /// Root collapses (tree height reduced by one)
    pub collapses: u64,
    /// Leaf merges
    pub leaf_merges: u64,
    /// Internal merges
    pub internal_merges: u64,
    /// Leaf levelings (one entry moved from a sibling)
    pub leaf_levels: u64,
    /// Internal levelings (one key rotated through the parent)
    pub internal_levels: u64,
}

/// Thread-safe statistics for delete operations.
#[derive(Default)]
pub struct DeleteStats {
    operations: AtomicU64,
    found: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    suspensions: AtomicU64,
    nodes_visited: AtomicU64,
    collapses: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    leaf_levels: AtomicU64,
    internal_levels: AtomicU64,
}

impl DeleteStats {
    /// Returns the number of finished operations.
    pub fn operations(&self) -> u64 {
        self.operations.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of deletes that removed an entry.
    pub fn found(&self) -> u64 {
        self.found.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of deletes whose key was absent.
    pub fn not_found(&self) -> u64 {
        self.not_found.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of failed deletes.
    pub fn failed(&self) -> u64 {
        self.failed.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of suspensions.
    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes visited.
    pub fn nodes_visited(&self) -> u64 {
        self.nodes_visited.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root collapses.
    pub fn collapses(&self) -> u64 {
        self.collapses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of internal merges.
    pub fn internal_merges(&self) -> u64 {
        self.internal_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf levelings.
    pub fn leaf_levels(&self) -> u64 {
        self.leaf_levels.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of internal levelings.
    pub fn internal_levels(&self) -> u64 {
        self.internal_levels.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_operations(&self) {
        self.operations.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_found(&self) {
        self.found.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_not_found(&self) {
        self.not_found.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_failed(&self) {
        self.failed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_suspensions(&self) {
        self.suspensions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_nodes_visited(&self) {
        self.nodes_visited.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_collapses(&self) {
        self.collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self, leaf: bool) {
        if leaf {
            self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.internal_merges.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn inc_levels(&self, leaf: bool) {
        if leaf {
            self.leaf_levels.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.internal_levels.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> DeleteStatsSnapshot {
        DeleteStatsSnapshot {
            operations: self.operations(),
            found: self.found(),
            not_found: self.not_found(),
            failed: self.failed(),
            suspensions: self.suspensions(),
            nodes_visited: self.nodes_visited(),
            collapses: self.collapses(),
            leaf_merges: self.leaf_merges(),
            internal_merges: self.internal_merges(),
            leaf_levels: self.leaf_levels(),
            internal_levels: self.internal_levels(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "arbor_btree::stats",
            operations = snapshot.operations,
            found = snapshot.found,
            not_found = snapshot.not_found,
            failed = snapshot.failed,
            suspensions = snapshot.suspensions,
            nodes_visited = snapshot.nodes_visited,
            collapses = snapshot.collapses,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            leaf_levels = snapshot.leaf_levels,
            internal_levels = snapshot.internal_levels,
            "delete stats snapshot"
        );
    }
}
