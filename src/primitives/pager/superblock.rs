use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    stamp_page, verify_page, ArborError, Geometry, PageId, Result,
};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::io::ErrorKind;
use std::ops::Range;

/// Block id of the superblock.
pub const SUPERBLOCK_PAGE: PageId = PageId(0);

const SB_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const SB_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const SB_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
const SB_RESERVED: Range<usize> = PAGE_HDR_LEN + 14..PAGE_HDR_LEN + 16;
const SB_ROOT: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const SB_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const SB_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const SB_FREE_PAGES: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const SB_MIN_ENTRIES: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 50;
const SB_MAX_ENTRIES: Range<usize> = PAGE_HDR_LEN + 50..PAGE_HDR_LEN + 52;
const SB_MAX_VALUE_LEN: Range<usize> = PAGE_HDR_LEN + 52..PAGE_HDR_LEN + 54;
const SB_RESERVED_2: Range<usize> = PAGE_HDR_LEN + 54..PAGE_HDR_LEN + 56;

/// Tree metadata stored in page 0: root pointer, allocation state, geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Superblock {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Random salt mixed into every page checksum.
    pub salt: u64,
    /// Format version number.
    pub format_version: u16,
    /// Root page of the tree; [`PageId::NULL`] when the tree is empty.
    pub root: PageId,
    /// Head of the free-page chain; [`PageId::NULL`] when empty.
    pub free_head: PageId,
    /// Next page id past the end of the file.
    pub next_page: PageId,
    /// Number of pages on the free chain.
    pub free_pages: u64,
    /// Occupancy bounds of the tree.
    pub geometry: Geometry,
}

impl Superblock {
    /// Creates a fresh superblock with a random salt and an empty tree.
    pub fn new(page_size: u32, geometry: Geometry) -> Self {
        Self {
            page_size,
            salt: OsRng.next_u64(),
            format_version: page::PAGE_FORMAT_VERSION,
            root: PageId::NULL,
            free_head: PageId::NULL,
            next_page: PageId(1),
            free_pages: 0,
            geometry,
        }
    }

    /// Encodes the superblock into a page buffer. The checksum is left for
    /// the write-back path to stamp.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size as usize;
        if buf.len() < page_size || page_size < SB_RESERVED_2.end {
            return Err(ArborError::Invalid("superblock buffer too small"));
        }
        buf[..page_size].fill(0);
        PageHeader::new(SUPERBLOCK_PAGE, PageKind::Superblock, self.page_size)?
            .encode(&mut buf[..PAGE_HDR_LEN])?;
        buf[SB_SALT].copy_from_slice(&self.salt.to_be_bytes());
        buf[SB_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[SB_FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        buf[SB_RESERVED].fill(0);
        buf[SB_ROOT].copy_from_slice(&self.root.0.to_be_bytes());
        buf[SB_FREE_HEAD].copy_from_slice(&self.free_head.0.to_be_bytes());
        buf[SB_NEXT_PAGE].copy_from_slice(&self.next_page.0.to_be_bytes());
        buf[SB_FREE_PAGES].copy_from_slice(&self.free_pages.to_be_bytes());
        buf[SB_MIN_ENTRIES].copy_from_slice(&self.geometry.min_entries.to_be_bytes());
        buf[SB_MAX_ENTRIES].copy_from_slice(&self.geometry.max_entries.to_be_bytes());
        buf[SB_MAX_VALUE_LEN].copy_from_slice(&self.geometry.max_value_len.to_be_bytes());
        buf[SB_RESERVED_2].fill(0);
        Ok(())
    }

    /// Decodes a superblock from page bytes. Checksums are the loader's job.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SB_RESERVED_2.end {
            return Err(ArborError::Corruption("superblock truncated"));
        }
        let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
        if header.kind != PageKind::Superblock {
            return Err(ArborError::Corruption("superblock has wrong kind"));
        }
        if header.page_no != SUPERBLOCK_PAGE {
            return Err(ArborError::Corruption("superblock page number mismatch"));
        }
        if buf[SB_RESERVED].iter().chain(buf[SB_RESERVED_2].iter()).any(|b| *b != 0) {
            return Err(ArborError::Corruption("superblock reserved field non-zero"));
        }
        let page_size = u32::from_be_bytes(page::read_array(&buf[SB_PAGE_SIZE])?);
        if page_size != header.page_size {
            return Err(ArborError::Corruption("superblock page size mismatch"));
        }
        let geometry = Geometry {
            min_entries: u16::from_be_bytes(page::read_array(&buf[SB_MIN_ENTRIES])?),
            max_entries: u16::from_be_bytes(page::read_array(&buf[SB_MAX_ENTRIES])?),
            max_value_len: u16::from_be_bytes(page::read_array(&buf[SB_MAX_VALUE_LEN])?),
        };
        Ok(Self {
            page_size,
            salt: u64::from_be_bytes(page::read_array(&buf[SB_SALT])?),
            format_version: u16::from_be_bytes(page::read_array(&buf[SB_FORMAT_VERSION])?),
            root: PageId(u64::from_be_bytes(page::read_array(&buf[SB_ROOT])?)),
            free_head: PageId(u64::from_be_bytes(page::read_array(&buf[SB_FREE_HEAD])?)),
            next_page: PageId(u64::from_be_bytes(page::read_array(&buf[SB_NEXT_PAGE])?)),
            free_pages: u64::from_be_bytes(page::read_array(&buf[SB_FREE_PAGES])?),
            geometry,
        })
    }
}

/// Formats page 0 of an empty device and syncs it.
pub fn create_superblock(io: &dyn FileIo, page_size: u32, geometry: Geometry) -> Result<Superblock> {
    if page_size < page::MIN_PAGE_SIZE {
        return Err(ArborError::Invalid("page size below minimum"));
    }
    geometry.validate(page_size)?;
    let sb = Superblock::new(page_size, geometry);
    let mut buf = vec![0u8; page_size as usize];
    sb.encode(&mut buf)?;
    stamp_page(SUPERBLOCK_PAGE.0, sb.salt, &mut buf)?;
    io.truncate(0)?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok(sb)
}

/// Loads and verifies page 0.
pub fn load_superblock(io: &dyn FileIo) -> Result<Superblock> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    read_or_truncated(io, 0, &mut hdr)?;
    let header = PageHeader::decode(&hdr)?;
    let mut buf = vec![0u8; header.page_size as usize];
    read_or_truncated(io, 0, &mut buf)?;
    let sb = Superblock::decode(&buf)?;
    verify_page(SUPERBLOCK_PAGE.0, sb.salt, &buf)?;
    Ok(sb)
}

fn read_or_truncated(io: &dyn FileIo, off: u64, dst: &mut [u8]) -> Result<()> {
    match io.read_at(off, dst) {
        Ok(()) => Ok(()),
        Err(ArborError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Err(ArborError::Corruption("superblock truncated"))
        }
        Err(err) => Err(err),
    }
}

impl fmt::Display for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Superblock(page_size={}, format_version={}, root={}, free_head={}, next_page={}, free_pages={}, min_entries={}, max_entries={}, max_value_len={})",
            self.page_size,
            self.format_version,
            self.root.0,
            self.free_head.0,
            self.next_page.0,
            self.free_pages,
            self.geometry.min_entries,
            self.geometry.max_entries,
            self.geometry.max_value_len,
        )
    }
}
