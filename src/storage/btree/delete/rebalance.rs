//! Collapse / merge / level decision for an underfull node on the delete path.

use tracing::debug;

use super::acquire::NodeBuf;
use crate::primitives::pager::Transaction;
use crate::storage::btree::node::Sibling;
use crate::storage::btree::page::Node;
use crate::types::{ArborError, Geometry, Result};

/// Structural action taken for an underfull node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rebalance {
    /// Node and sibling are combined into their singleton parent's block.
    Collapse,
    /// Sibling is folded into the node.
    Merge,
    /// One entry moves from the sibling to the node.
    Level,
}

/// Picks the action for an underfull node given its parent and sibling.
pub fn decide(parent: &Node, sibling: &Node, geometry: &Geometry) -> Rebalance {
    if !sibling.is_underfull_or_min(geometry) {
        Rebalance::Level
    } else if parent.is_singleton() {
        Rebalance::Collapse
    } else {
        Rebalance::Merge
    }
}

/// Applies the chosen action to the held buffers.
///
/// On collapse the node and sibling are released and freed and the parent
/// moves into `current`. On merge the sibling is released and freed. On
/// level the sibling is written and released. Buffers still held when an
/// error is returned stay in their slots for the caller to release.
pub(super) fn apply(
    txn: &mut Transaction,
    current: &mut Option<NodeBuf>,
    parent: &mut Option<NodeBuf>,
    sibling: &mut Option<(NodeBuf, Sibling)>,
    geometry: &Geometry,
) -> Result<Rebalance> {
    let (Some(node), Some(par), Some((sib, link))) =
        (current.as_mut(), parent.as_mut(), sibling.as_mut())
    else {
        return Err(ArborError::Invariant(
            "rebalance requires node, parent and sibling",
        ));
    };
    if link.node != node.page || link.page != sib.page {
        return Err(ArborError::Invariant("sibling link does not match held buffers"));
    }
    let link = *link;
    let leaf = node.node.is_leaf();
    let action = decide(&par.node, &sib.node, geometry);
    match action {
        Rebalance::Collapse => {
            par.node
                .collapse(&mut node.node, &mut sib.node, &link, geometry)?;
            par.flush()?;
            let freed = [node.page, sib.page];
            if let Some(node) = current.take() {
                node.release();
            }
            if let Some((sib, _)) = sibling.take() {
                sib.release();
            }
            *current = parent.take();
            for page in freed {
                txn.free_page(page)?;
            }
        }
        Rebalance::Merge => {
            node.node.merge(&mut par.node, &mut sib.node, &link, geometry)?;
            node.flush()?;
            par.flush()?;
            let freed = sib.page;
            if let Some((sib, _)) = sibling.take() {
                sib.release();
            }
            txn.free_page(freed)?;
        }
        Rebalance::Level => {
            node.node.level(&mut par.node, &mut sib.node, &link)?;
            node.flush()?;
            par.flush()?;
            sib.flush()?;
            if let Some((sib, _)) = sibling.take() {
                sib.release();
            }
        }
    }
    debug!(
        target: "arbor_btree::rebalance",
        ?action,
        leaf,
        node = link.node.0,
        sibling = link.page.0,
        side = ?link.side,
        "delete.rebalance"
    );
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::page::{InternalNode, LeafNode};
    use crate::types::PageId;

    fn leaf(n: u64) -> Node {
        Node::Leaf(LeafNode {
            entries: (0..n).map(|k| (k, Vec::new())).collect(),
        })
    }

    fn parent(keys: usize) -> Node {
        Node::Internal(InternalNode {
            keys: (1..=keys as u64).map(|k| k * 100).collect(),
            children: (0..=keys as u64).map(|c| PageId(c + 1)).collect(),
        })
    }

    #[test]
    fn decision_table() {
        let g = Geometry::new(2, 5, 8);
        assert_eq!(decide(&parent(1), &leaf(2), &g), Rebalance::Collapse);
        assert_eq!(decide(&parent(2), &leaf(2), &g), Rebalance::Merge);
        assert_eq!(decide(&parent(1), &leaf(3), &g), Rebalance::Level);
        assert_eq!(decide(&parent(3), &leaf(4), &g), Rebalance::Level);
    }
}
