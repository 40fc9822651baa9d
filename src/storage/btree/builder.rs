//! Offline tree construction: bulk loading and exact shapes.

use tracing::debug;

use super::page::{InternalNode, LeafNode, Node};
use crate::primitives::pager::{AccessMode, Pager, Transaction, TxnMode};
use crate::types::{ArborError, Geometry, PageId, Result};

/// Exact tree shape, written verbatim by [`TreeBuilder::write_spec`].
///
/// Separators are derived from the least key under each child, so a spec
/// only lists leaf keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeSpec {
    /// A leaf holding these keys.
    Leaf(Vec<u64>),
    /// An internal node over these children.
    Internal(Vec<TreeSpec>),
}

impl TreeSpec {
    /// Leaf with `keys`.
    pub fn leaf(keys: impl IntoIterator<Item = u64>) -> Self {
        TreeSpec::Leaf(keys.into_iter().collect())
    }

    /// Internal node over `children`.
    pub fn internal(children: impl IntoIterator<Item = TreeSpec>) -> Self {
        TreeSpec::Internal(children.into_iter().collect())
    }

    fn first_key(&self) -> Option<u64> {
        match self {
            TreeSpec::Leaf(keys) => keys.first().copied(),
            TreeSpec::Internal(children) => children.first().and_then(TreeSpec::first_key),
        }
    }
}

/// Value stored for `key` by [`TreeBuilder::write_spec`].
pub fn spec_value(key: u64) -> Vec<u8> {
    key.to_string().into_bytes()
}

/// Builds trees inside one blocking write transaction.
#[derive(Clone, Debug, Default)]
pub struct TreeBuilder {
    fill: Option<u16>,
    geometry: Option<Geometry>,
}

impl TreeBuilder {
    /// Creates a builder that packs nodes as full as the geometry allows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets `entries` per node, clamped to the geometry's bounds.
    pub fn fill(mut self, entries: u16) -> Self {
        self.fill = Some(entries);
        self
    }

    /// Publishes `geometry` with the rebuilt tree. The old tree is discarded
    /// wholesale, so its nodes never have to satisfy the new bounds.
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Replaces the tree with one holding `entries`, which must be sorted by
    /// strictly ascending key. Pages of the previous tree go to the free
    /// chain. Returns the new root ([`PageId::NULL`] for no entries).
    pub fn bulk_load(
        &self,
        pager: &Pager,
        entries: impl IntoIterator<Item = (u64, Vec<u8>)>,
    ) -> Result<PageId> {
        let geometry = self.geometry.unwrap_or(pager.superblock()?.geometry);
        let entries: Vec<(u64, Vec<u8>)> = entries.into_iter().collect();
        if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(ArborError::Invalid("bulk load keys must be strictly ascending"));
        }
        if entries
            .iter()
            .any(|(_, value)| value.len() > geometry.max_value_len as usize)
        {
            return Err(ArborError::Invalid("value longer than max_value_len"));
        }

        let mut txn = self.begin(pager)?;
        let fill = self.fill.unwrap_or(geometry.max_entries);
        let count = entries.len();

        let mut level: Vec<(u64, PageId)> = Vec::new();
        let mut rest = entries.into_iter();
        for size in plan(count, fill, &geometry, 0) {
            let chunk: Vec<(u64, Vec<u8>)> = rest.by_ref().take(size).collect();
            let first = chunk.first().map(|(k, _)| *k).unwrap_or(0);
            let page = write_node(&mut txn, &Node::Leaf(LeafNode { entries: chunk }))?;
            level.push((first, page));
        }
        let mut height = usize::from(!level.is_empty());
        while level.len() > 1 {
            let mut next = Vec::new();
            let mut rest = level.into_iter();
            let total = rest.len();
            for size in plan(total, fill, &geometry, 1) {
                let group: Vec<(u64, PageId)> = rest.by_ref().take(size).collect();
                let first = group[0].0;
                let node = InternalNode {
                    keys: group[1..].iter().map(|(k, _)| *k).collect(),
                    children: group.iter().map(|(_, p)| *p).collect(),
                };
                next.push((first, write_node(&mut txn, &Node::Internal(node))?));
            }
            level = next;
            height += 1;
        }
        let root = level.first().map(|(_, page)| *page).unwrap_or(PageId::NULL);
        txn.set_root(root)?;
        txn.commit_blocking()?;
        debug!(target: "arbor_btree::builder", entries = count, height, root = root.0, "builder.bulk_load");
        Ok(root)
    }

    /// Replaces the tree with exactly `spec`. Occupancy bounds are not
    /// enforced; run the verifier to check the result.
    pub fn write_spec(&self, pager: &Pager, spec: &TreeSpec) -> Result<PageId> {
        let mut txn = self.begin(pager)?;
        let root = write_spec_node(&mut txn, spec)?;
        txn.set_root(root)?;
        txn.commit_blocking()?;
        Ok(root)
    }

    /// Opens the rebuild transaction: stages the new geometry and frees the
    /// current tree.
    fn begin(&self, pager: &Pager) -> Result<Transaction> {
        let mut txn = pager.begin_blocking(TxnMode::Write)?;
        if let Some(geometry) = self.geometry {
            txn.set_geometry(geometry)?;
        }
        free_tree(&mut txn, pager.superblock()?.root)?;
        Ok(txn)
    }
}

/// Splits `count` items into group sizes whose occupancy stays within the
/// geometry. `extra` is 1 when grouping children (a node with `n` keys has
/// `n + 1` children).
fn plan(count: usize, fill: u16, geometry: &Geometry, extra: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let min = geometry.min_entries as usize + extra;
    let max = geometry.max_entries as usize + extra;
    let fill = (fill as usize + extra).clamp(min, max);
    let lower = count.div_ceil(max);
    let upper = (count / min).max(1);
    let groups = (count / fill).clamp(lower.min(upper), upper).max(1);
    let base = count / groups;
    let spill = count % groups;
    (0..groups)
        .map(|i| base + usize::from(i < spill))
        .collect()
}

fn write_node(txn: &mut Transaction, node: &Node) -> Result<PageId> {
    let mut buffer = txn.allocate_page()?;
    let page = buffer.page_id();
    let encoded = match buffer.data_mut() {
        Ok(mut data) => node.encode(page, &mut data),
        Err(err) => Err(err),
    };
    let dirty = encoded.and_then(|()| buffer.set_dirty());
    buffer.release();
    dirty?;
    Ok(page)
}

fn write_spec_node(txn: &mut Transaction, spec: &TreeSpec) -> Result<PageId> {
    let node = match spec {
        TreeSpec::Leaf(keys) => Node::Leaf(LeafNode {
            entries: keys.iter().map(|k| (*k, spec_value(*k))).collect(),
        }),
        TreeSpec::Internal(children) => {
            if children.len() < 2 {
                return Err(ArborError::Invalid("internal spec needs at least two children"));
            }
            let mut pages = Vec::with_capacity(children.len());
            for child in children {
                pages.push(write_spec_node(txn, child)?);
            }
            let keys = children[1..]
                .iter()
                .map(|child| {
                    child
                        .first_key()
                        .ok_or(ArborError::Invalid("spec child without keys"))
                })
                .collect::<Result<Vec<u64>>>()?;
            Node::Internal(InternalNode {
                keys,
                children: pages,
            })
        }
    };
    write_node(txn, &node)
}

/// Schedules every page reachable from `root` for the free chain.
fn free_tree(txn: &mut Transaction, root: PageId) -> Result<()> {
    if root.is_null() {
        return Ok(());
    }
    let mut stack = vec![root];
    while let Some(page) = stack.pop() {
        let buffer = txn.acquire_blocking(page, AccessMode::Read)?;
        let decoded = Node::decode(page, &buffer.data());
        buffer.release();
        if let Node::Internal(internal) = decoded? {
            stack.extend(internal.children);
        }
        txn.free_page(page)?;
    }
    Ok(())
}
