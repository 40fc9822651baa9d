#![forbid(unsafe_code)]

//! Identifiers, errors, and page metadata shared by the pager and the B-tree.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod checksum;

pub use checksum::{stamp_page, verify_page};

/// Block identifier of a page in the page file.
///
/// Page 0 always holds the superblock, so `PageId(0)` doubles as the
/// "no page" marker wherever a root or free-list link is stored.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl PageId {
    /// Marker for an absent page link.
    pub const NULL: PageId = PageId(0);

    /// Returns true if this id is the absent-link marker.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a transaction issued by the pager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address used by the pager to route completion events back to the
/// operation that issued a request.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct WaiterId(pub u64);

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the pager and the B-tree.
#[derive(thiserror::Error, Debug)]
pub enum ArborError {
    /// Device failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument or configuration that cannot be honored.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A collaborator delivered an event the receiver was not waiting for.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// Internal state-machine invariant failed at a transition boundary.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    /// The operation was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Occupancy bounds of a tree, persisted in the superblock.
///
/// Leaf occupancy counts entries; internal occupancy counts separator keys.
/// Every non-root node keeps at least `min_entries` and at most
/// `max_entries`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Fewest entries a non-root node may hold.
    pub min_entries: u16,
    /// Most entries any node may hold.
    pub max_entries: u16,
    /// Largest value payload accepted in a leaf entry.
    pub max_value_len: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            min_entries: 4,
            max_entries: 16,
            max_value_len: 64,
        }
    }
}

impl Geometry {
    /// Creates a geometry with the given bounds.
    pub fn new(min_entries: u16, max_entries: u16, max_value_len: u16) -> Self {
        Self {
            min_entries,
            max_entries,
            max_value_len,
        }
    }

    /// Checks that the bounds allow merges and that a full node fits a page.
    pub fn validate(&self, page_size: u32) -> Result<()> {
        if self.min_entries == 0 {
            return Err(ArborError::Invalid("min_entries must be at least 1"));
        }
        // An internal merge pulls a separator down next to two minimal nodes.
        if (self.max_entries as usize) < 2 * self.min_entries as usize + 1 {
            return Err(ArborError::Invalid(
                "max_entries must be at least 2 * min_entries + 1",
            ));
        }
        let leaf_bytes = page::NODE_HDR_LEN
            + self.max_entries as usize * (page::LEAF_ENTRY_OVERHEAD + self.max_value_len as usize);
        let internal_bytes =
            page::NODE_HDR_LEN + 8 + self.max_entries as usize * page::INTERNAL_PAIR_LEN;
        if page::PAGE_HDR_LEN + leaf_bytes.max(internal_bytes) > page_size as usize {
            return Err(ArborError::Invalid("geometry does not fit in a page"));
        }
        Ok(())
    }
}

pub mod page {
    //! Shared on-disk page metadata used by pager components.

    use core::convert::{TryFrom, TryInto};

    use super::{ArborError, PageId, Result};

    pub const PAGE_MAGIC: [u8; 4] = *b"ARBR";
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    pub const MIN_PAGE_SIZE: u32 = 256;
    pub const PAGE_HDR_LEN: usize = 24;

    /// Bytes preceding the entries of a B-tree node body (entry count).
    pub const NODE_HDR_LEN: usize = 2;
    /// Key plus value length prefix.
    pub const LEAF_ENTRY_OVERHEAD: usize = 8 + 2;
    /// Separator key plus child id.
    pub const INTERNAL_PAIR_LEN: usize = 8 + 8;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const CRC32: Range<usize> = 20..24;
    }

    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        Superblock = 1,
        FreeList = 2,
        BTreeLeaf = 3,
        BTreeInternal = 4,
    }

    impl PageKind {
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = ArborError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Superblock),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::BTreeLeaf),
                4 => Ok(PageKind::BTreeInternal),
                _ => Err(ArborError::Corruption("unknown page kind")),
            }
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        pub format_version: u16,
        pub kind: PageKind,
        pub page_size: u32,
        pub page_no: PageId,
        pub crc32: u32,
    }

    impl PageHeader {
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ArborError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                crc32: 0,
            })
        }

        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(ArborError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(ArborError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(ArborError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(read_array(&hdr[header::FORMAT_VERSION])?);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(ArborError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(ArborError::Corruption(
                    "page header reserved byte not zero",
                ));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(read_array(&hdr[header::PAGE_SIZE])?);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ArborError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(read_array(&hdr[header::PAGE_NO])?));
            let crc32 = u32::from_be_bytes(read_array(&hdr[header::CRC32])?);
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                crc32,
            })
        }
    }

    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(ArborError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Copies a fixed-width field out of a byte slice.
    pub fn read_array<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
        src.get(..N)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(ArborError::Corruption("field truncated"))
    }
}

#[cfg(test)]
mod tests {
    use super::{page, page::PageHeader, page::PageKind, ArborError, Geometry, PageId};
    use std::convert::TryFrom;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let header = PageHeader::new(PageId(42), PageKind::BTreeLeaf, page::DEFAULT_PAGE_SIZE)
            .unwrap()
            .with_crc32(0xDEADBEEF);
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn clear_crc32_zeroes_field() {
        let mut buf = [0xFFu8; page::PAGE_HDR_LEN];
        page::clear_crc32(&mut buf).unwrap();
        assert!(buf[page::header::CRC32].iter().all(|&b| b == 0));
    }

    #[test]
    fn page_kind_from_u8_rejects_unknown() {
        assert!(PageKind::try_from(0).is_err());
        assert!(PageKind::try_from(9).is_err());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let buf = [0u8; page::PAGE_HDR_LEN];
        assert!(matches!(
            PageHeader::decode(&buf),
            Err(ArborError::Corruption("invalid page magic"))
        ));
    }

    #[test]
    fn geometry_requires_room_for_merges() {
        assert!(Geometry::new(2, 5, 8).validate(4096).is_ok());
        assert!(Geometry::new(2, 4, 8).validate(4096).is_err());
        assert!(Geometry::new(0, 4, 8).validate(4096).is_err());
    }

    #[test]
    fn geometry_must_fit_page() {
        assert!(Geometry::new(4, 16, 64).validate(page::DEFAULT_PAGE_SIZE).is_ok());
        assert!(Geometry::new(40, 200, 64).validate(page::DEFAULT_PAGE_SIZE).is_err());
    }

    #[test]
    fn null_page_id() {
        assert!(PageId::NULL.is_null());
        assert!(!PageId(3).is_null());
    }
}
