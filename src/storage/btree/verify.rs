//! Structural checks over a committed tree.

use std::collections::HashSet;
use std::fmt;

use super::page::Node;
use crate::primitives::pager::{AccessMode, Pager, Transaction, TxnMode};
use crate::types::{Geometry, PageId, Result};

/// Summary of a tree walk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Root page, [`PageId::NULL`] for an empty tree.
    pub root: PageId,
    /// Levels from root to leaves; 0 for an empty tree.
    pub height: usize,
    /// Leaf nodes reached.
    pub leaves: usize,
    /// Internal nodes reached.
    pub internals: usize,
    /// Entries stored in leaves.
    pub keys: usize,
    /// Pages on the free chain.
    pub free_pages: usize,
    /// Human-readable descriptions of every violation found.
    pub issues: Vec<String>,
}

impl VerifyReport {
    /// True when no issue was found.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "root={} height={} leaves={} internals={} keys={} free_pages={} issues={}",
            self.root.0,
            self.height,
            self.leaves,
            self.internals,
            self.keys,
            self.free_pages,
            self.issues.len()
        )
    }
}

struct Walk<'a> {
    txn: Transaction,
    geometry: Geometry,
    report: &'a mut VerifyReport,
    seen: HashSet<PageId>,
    leaf_depth: Option<usize>,
    entries: Option<Vec<(u64, Vec<u8>)>>,
}

impl Walk<'_> {
    fn visit(&mut self, page: PageId, depth: usize, lo: Option<u64>, hi: Option<u64>) -> Result<()> {
        if !self.seen.insert(page) {
            self.report
                .issues
                .push(format!("page {} reachable more than once", page.0));
            return Ok(());
        }
        let buffer = self.txn.acquire_blocking(page, AccessMode::Read)?;
        let decoded = Node::decode(page, &buffer.data());
        buffer.release();
        let node = decoded?;
        let is_root = depth == 1;
        if !is_root && node.is_below_min(&self.geometry) {
            self.report.issues.push(format!(
                "page {} holds {} entries, below minimum {}",
                page.0,
                node.occupancy(),
                self.geometry.min_entries
            ));
        }
        if node.occupancy() > self.geometry.max_entries as usize {
            self.report.issues.push(format!(
                "page {} holds {} entries, above maximum {}",
                page.0,
                node.occupancy(),
                self.geometry.max_entries
            ));
        }
        let keys: Vec<u64> = match &node {
            Node::Leaf(leaf) => leaf.entries.iter().map(|(k, _)| *k).collect(),
            Node::Internal(internal) => internal.keys.clone(),
        };
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            self.report
                .issues
                .push(format!("page {} keys out of order", page.0));
        }
        let in_range = |k: &u64| lo.map_or(true, |lo| *k >= lo) && hi.map_or(true, |hi| *k < hi);
        if !keys.iter().all(in_range) {
            self.report
                .issues
                .push(format!("page {} has keys outside its parent's bounds", page.0));
        }
        match node {
            Node::Leaf(leaf) => {
                self.report.leaves += 1;
                self.report.keys += leaf.entries.len();
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => self.report.issues.push(format!(
                        "leaf {} at depth {depth}, expected {expected}",
                        page.0
                    )),
                    Some(_) => {}
                }
                if let Some(entries) = self.entries.as_mut() {
                    entries.extend(leaf.entries);
                }
            }
            Node::Internal(internal) => {
                self.report.internals += 1;
                if internal.keys.is_empty() {
                    self.report
                        .issues
                        .push(format!("internal page {} has a single child", page.0));
                }
                for (i, child) in internal.children.iter().enumerate() {
                    let child_lo = if i == 0 { lo } else { Some(internal.keys[i - 1]) };
                    let child_hi = internal.keys.get(i).copied().or(hi);
                    self.visit(*child, depth + 1, child_lo, child_hi)?;
                }
            }
        }
        Ok(())
    }
}

fn walk(pager: &Pager, entries: Option<Vec<(u64, Vec<u8>)>>) -> Result<(VerifyReport, Option<Vec<(u64, Vec<u8>)>>)> {
    let sb = pager.superblock()?;
    let free = pager.free_pages()?;
    let mut report = VerifyReport {
        root: sb.root,
        free_pages: free.len(),
        ..VerifyReport::default()
    };
    let mut walk = Walk {
        txn: pager.begin_blocking(TxnMode::Read)?,
        geometry: sb.geometry,
        report: &mut report,
        seen: HashSet::new(),
        leaf_depth: None,
        entries,
    };
    if !sb.root.is_null() {
        walk.visit(sb.root, 1, None, None)?;
    }
    let Walk {
        txn,
        seen,
        leaf_depth,
        entries,
        ..
    } = walk;
    txn.commit_blocking()?;
    report.height = leaf_depth.unwrap_or(0);
    for page in free {
        if seen.contains(&page) {
            report
                .issues
                .push(format!("page {} is both reachable and free", page.0));
        }
    }
    Ok((report, entries))
}

/// Walks the committed tree and reports its shape and every structural issue.
pub fn verify_tree(pager: &Pager) -> Result<VerifyReport> {
    walk(pager, None).map(|(report, _)| report)
}

/// Returns every entry in key order.
pub fn collect_entries(pager: &Pager) -> Result<Vec<(u64, Vec<u8>)>> {
    walk(pager, Some(Vec::new())).map(|(_, entries)| entries.unwrap_or_default())
}
