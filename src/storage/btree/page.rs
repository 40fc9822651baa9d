use std::convert::TryFrom;

use crate::types::page::{
    self, PageHeader, PageKind, INTERNAL_PAIR_LEN, LEAF_ENTRY_OVERHEAD, NODE_HDR_LEN, PAGE_HDR_LEN,
};
use crate::types::{ArborError, PageId, Result};

const COUNT_OFFSET: usize = PAGE_HDR_LEN;
const BODY_OFFSET: usize = PAGE_HDR_LEN + NODE_HDR_LEN;

/// Leaf node: key/value entries in ascending key order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries sorted by key.
    pub entries: Vec<(u64, Vec<u8>)>,
}

/// Internal node: `keys.len() + 1` children; `keys[i]` is the least key
/// reachable through `children[i + 1]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalNode {
    /// Separator keys, ascending.
    pub keys: Vec<u64>,
    /// Child page ids.
    pub children: Vec<PageId>,
}

/// Decoded tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// A leaf holding entries.
    Leaf(LeafNode),
    /// An internal node holding separators and child pointers.
    Internal(InternalNode),
}

impl Node {
    /// Page kind used when this node is encoded.
    pub fn page_kind(&self) -> PageKind {
        match self {
            Node::Leaf(_) => PageKind::BTreeLeaf,
            Node::Internal(_) => PageKind::BTreeInternal,
        }
    }

    /// Bytes needed to encode the node, header included.
    pub fn encoded_len(&self) -> usize {
        BODY_OFFSET
            + match self {
                Node::Leaf(leaf) => leaf
                    .entries
                    .iter()
                    .map(|(_, v)| LEAF_ENTRY_OVERHEAD + v.len())
                    .sum::<usize>(),
                Node::Internal(internal) => 8 + internal.keys.len() * INTERNAL_PAIR_LEN,
            }
    }

    /// Encodes the node into a full page buffer, rewriting the page header.
    /// The checksum field is left zero for the write-back path.
    pub fn encode(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let page_size =
            u32::try_from(buf.len()).map_err(|_| ArborError::Invalid("page buffer too large"))?;
        if self.encoded_len() > buf.len() {
            return Err(ArborError::Invalid("node does not fit in page"));
        }
        buf.fill(0);
        PageHeader::new(page_id, self.page_kind(), page_size)?.encode(&mut buf[..PAGE_HDR_LEN])?;
        let mut pos = BODY_OFFSET;
        match self {
            Node::Leaf(leaf) => {
                write_count(buf, leaf.entries.len())?;
                for (key, value) in &leaf.entries {
                    let len = u16::try_from(value.len())
                        .map_err(|_| ArborError::Invalid("value too long"))?;
                    put(buf, &mut pos, &key.to_be_bytes());
                    put(buf, &mut pos, &len.to_be_bytes());
                    put(buf, &mut pos, value);
                }
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(ArborError::Invariant(
                        "internal node child count must exceed key count by one",
                    ));
                }
                write_count(buf, internal.keys.len())?;
                put(buf, &mut pos, &internal.children[0].0.to_be_bytes());
                for (key, child) in internal.keys.iter().zip(&internal.children[1..]) {
                    put(buf, &mut pos, &key.to_be_bytes());
                    put(buf, &mut pos, &child.0.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Decodes the node stored in `buf`, checking the page header.
    pub fn decode(page_id: PageId, buf: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        if header.page_no != page_id {
            return Err(ArborError::Corruption("node page number mismatch"));
        }
        if buf.len() < BODY_OFFSET {
            return Err(ArborError::Corruption("node page truncated"));
        }
        let count = u16::from_be_bytes(page::read_array(&buf[COUNT_OFFSET..BODY_OFFSET])?) as usize;
        let mut pos = BODY_OFFSET;
        match header.kind {
            PageKind::BTreeLeaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = u64::from_be_bytes(take::<8>(buf, &mut pos)?);
                    let len = u16::from_be_bytes(take::<2>(buf, &mut pos)?) as usize;
                    let end = pos
                        .checked_add(len)
                        .filter(|end| *end <= buf.len())
                        .ok_or(ArborError::Corruption("leaf value exceeds page"))?;
                    entries.push((key, buf[pos..end].to_vec()));
                    pos = end;
                }
                Ok(Node::Leaf(LeafNode { entries }))
            }
            PageKind::BTreeInternal => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(PageId(u64::from_be_bytes(take::<8>(buf, &mut pos)?)));
                for _ in 0..count {
                    keys.push(u64::from_be_bytes(take::<8>(buf, &mut pos)?));
                    children.push(PageId(u64::from_be_bytes(take::<8>(buf, &mut pos)?)));
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            _ => Err(ArborError::Corruption("page is not a tree node")),
        }
    }
}

fn write_count(buf: &mut [u8], count: usize) -> Result<()> {
    let count = u16::try_from(count).map_err(|_| ArborError::Invalid("node count overflow"))?;
    buf[COUNT_OFFSET..BODY_OFFSET].copy_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put(buf: &mut [u8], pos: &mut usize, bytes: &[u8]) {
    buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
}

fn take<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let end = *pos + N;
    if end > buf.len() {
        return Err(ArborError::Corruption("node body exceeds page"));
    }
    let out = page::read_array(&buf[*pos..end])?;
    *pos = end;
    Ok(out)
}
