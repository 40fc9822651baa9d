use crate::types::{ArborError, Geometry, PageId, Result};

use super::page::{InternalNode, LeafNode, Node};

/// Which side of the node its chosen sibling sits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// The predecessor: `parent.children[index - 1]`.
    Left,
    /// The successor: `parent.children[index + 1]`.
    Right,
}

/// Position of a node and its chosen sibling under their common parent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sibling {
    /// Page of the node the key descends into.
    pub node: PageId,
    /// Page of the sibling.
    pub page: PageId,
    /// Which side the sibling is on.
    pub side: Side,
    /// Index of `node` in the parent's child list.
    pub index: usize,
}

impl Sibling {
    fn separator(&self) -> usize {
        match self.side {
            Side::Left => self.index - 1,
            Side::Right => self.index,
        }
    }

    fn sibling_index(&self) -> usize {
        match self.side {
            Side::Left => self.index - 1,
            Side::Right => self.index + 1,
        }
    }
}

impl InternalNode {
    /// Index of the child whose range covers `key`.
    pub fn child_index(&self, key: u64) -> usize {
        self.keys.partition_point(|k| *k <= key)
    }

    fn check_link(&self, link: &Sibling) -> Result<()> {
        if link.side == Side::Left && link.index == 0 {
            return Err(ArborError::Corruption("left sibling of the first child"));
        }
        let sib = link.sibling_index();
        if self.children.get(link.index) != Some(&link.node)
            || self.children.get(sib) != Some(&link.page)
        {
            return Err(ArborError::Corruption("sibling is not adjacent under parent"));
        }
        Ok(())
    }
}

fn as_internal(node: &Node) -> Result<&InternalNode> {
    match node {
        Node::Internal(internal) => Ok(internal),
        Node::Leaf(_) => Err(ArborError::Corruption("expected an internal node")),
    }
}

fn as_internal_mut(node: &mut Node) -> Result<&mut InternalNode> {
    match node {
        Node::Internal(internal) => Ok(internal),
        Node::Leaf(_) => Err(ArborError::Corruption("expected an internal node")),
    }
}

impl Node {
    /// Whether this node holds entries.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Entry count for a leaf, separator count for an internal node.
    pub fn occupancy(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(internal) => internal.keys.len(),
        }
    }

    /// True when the node cannot give up an entry without dropping below the
    /// minimum. Checked before descending past a non-root node.
    pub fn is_underfull(&self, geometry: &Geometry) -> bool {
        self.occupancy() <= geometry.min_entries as usize
    }

    /// True when the node has no entry to lend to a sibling.
    pub fn is_underfull_or_min(&self, geometry: &Geometry) -> bool {
        self.occupancy() <= geometry.min_entries as usize
    }

    /// True when a non-root node violates the occupancy bound.
    pub fn is_below_min(&self, geometry: &Geometry) -> bool {
        self.occupancy() < geometry.min_entries as usize
    }

    /// An internal node with a single separator (two children).
    pub fn is_singleton(&self) -> bool {
        matches!(self, Node::Internal(internal) if internal.keys.len() == 1)
    }

    /// Child page whose range covers `key`.
    pub fn lookup(&self, key: u64) -> Result<PageId> {
        let internal = as_internal(self)?;
        internal
            .children
            .get(internal.child_index(key))
            .copied()
            .ok_or(ArborError::Corruption("internal node has too few children"))
    }

    /// Chooses the sibling of the child covering `key`: the predecessor when
    /// there is one, otherwise the successor.
    pub fn sibling(&self, key: u64) -> Result<Sibling> {
        let internal = as_internal(self)?;
        if internal.children.len() < 2 {
            return Err(ArborError::Corruption("internal node without siblings"));
        }
        let index = internal.child_index(key);
        let (side, sib) = if index > 0 {
            (Side::Left, index - 1)
        } else {
            (Side::Right, 1)
        };
        Ok(Sibling {
            node: internal.children[index],
            page: internal.children[sib],
            side,
            index,
        })
    }

    /// Replaces this singleton parent's content with the combined content of
    /// its two children. Both children are emptied.
    pub fn collapse(
        &mut self,
        node: &mut Node,
        sibling: &mut Node,
        link: &Sibling,
        geometry: &Geometry,
    ) -> Result<()> {
        let parent = as_internal(self)?;
        if parent.keys.len() != 1 {
            return Err(ArborError::Corruption("collapse of a non-singleton parent"));
        }
        parent.check_link(link)?;
        let separator = parent.keys[0];
        let (left, right) = match link.side {
            Side::Left => (sibling, node),
            Side::Right => (node, sibling),
        };
        let combined = match (&mut *left, &mut *right) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                let mut entries = std::mem::take(&mut l.entries);
                entries.append(&mut r.entries);
                Node::Leaf(LeafNode { entries })
            }
            (Node::Internal(l), Node::Internal(r)) => {
                let mut keys = std::mem::take(&mut l.keys);
                keys.push(separator);
                keys.append(&mut r.keys);
                let mut children = std::mem::take(&mut l.children);
                children.append(&mut r.children);
                Node::Internal(InternalNode { keys, children })
            }
            _ => return Err(ArborError::Corruption("collapse of mismatched node kinds")),
        };
        if combined.occupancy() > geometry.max_entries as usize {
            return Err(ArborError::Corruption("collapse overflows node capacity"));
        }
        *self = combined;
        Ok(())
    }

    /// Folds `sibling` into this node and drops the sibling's separator and
    /// child pointer from `parent`. The sibling is emptied.
    pub fn merge(
        &mut self,
        parent: &mut Node,
        sibling: &mut Node,
        link: &Sibling,
        geometry: &Geometry,
    ) -> Result<()> {
        let parent = as_internal_mut(parent)?;
        parent.check_link(link)?;
        if parent.keys.len() < 2 {
            return Err(ArborError::Corruption("merge under a singleton parent"));
        }
        let sep = link.separator();
        let extra = usize::from(!self.is_leaf());
        if self.occupancy() + sibling.occupancy() + extra > geometry.max_entries as usize {
            return Err(ArborError::Corruption("merge overflows node capacity"));
        }
        match (&mut *self, sibling) {
            (Node::Leaf(n), Node::Leaf(s)) => match link.side {
                Side::Left => {
                    let mut entries = std::mem::take(&mut s.entries);
                    entries.append(&mut n.entries);
                    n.entries = entries;
                }
                Side::Right => n.entries.append(&mut s.entries),
            },
            (Node::Internal(n), Node::Internal(s)) => match link.side {
                Side::Left => {
                    let mut keys = std::mem::take(&mut s.keys);
                    keys.push(parent.keys[sep]);
                    keys.append(&mut n.keys);
                    n.keys = keys;
                    let mut children = std::mem::take(&mut s.children);
                    children.append(&mut n.children);
                    n.children = children;
                }
                Side::Right => {
                    n.keys.push(parent.keys[sep]);
                    n.keys.append(&mut s.keys);
                    n.children.append(&mut s.children);
                }
            },
            _ => return Err(ArborError::Corruption("merge of mismatched node kinds")),
        }
        parent.keys.remove(sep);
        parent.children.remove(link.sibling_index());
        Ok(())
    }

    /// Moves one entry from `sibling` into this node through the separator
    /// in `parent`.
    pub fn level(&mut self, parent: &mut Node, sibling: &mut Node, link: &Sibling) -> Result<()> {
        let parent = as_internal_mut(parent)?;
        parent.check_link(link)?;
        if sibling.occupancy() < 2 {
            return Err(ArborError::Corruption("level from a sibling with nothing to lend"));
        }
        let sep = link.separator();
        match (&mut *self, sibling) {
            (Node::Leaf(n), Node::Leaf(s)) => match link.side {
                Side::Left => {
                    let moved = s
                        .entries
                        .pop()
                        .ok_or(ArborError::Corruption("empty leaf sibling"))?;
                    parent.keys[sep] = moved.0;
                    n.entries.insert(0, moved);
                }
                Side::Right => {
                    n.entries.push(s.entries.remove(0));
                    parent.keys[sep] = s.entries[0].0;
                }
            },
            (Node::Internal(n), Node::Internal(s)) => match link.side {
                Side::Left => {
                    let (Some(key), Some(child)) = (s.keys.pop(), s.children.pop()) else {
                        return Err(ArborError::Corruption("empty internal sibling"));
                    };
                    n.keys.insert(0, parent.keys[sep]);
                    n.children.insert(0, child);
                    parent.keys[sep] = key;
                }
                Side::Right => {
                    n.keys.push(parent.keys[sep]);
                    n.children.push(s.children.remove(0));
                    parent.keys[sep] = s.keys.remove(0);
                }
            },
            _ => return Err(ArborError::Corruption("level of mismatched node kinds")),
        }
        Ok(())
    }

    /// Removes `key` from a leaf. Returns whether it was present.
    pub fn remove(&mut self, key: u64) -> Result<bool> {
        match self {
            Node::Leaf(leaf) => match leaf.entries.binary_search_by_key(&key, |(k, _)| *k) {
                Ok(pos) => {
                    leaf.entries.remove(pos);
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            Node::Internal(_) => Err(ArborError::Invariant("remove on an internal node")),
        }
    }
}
