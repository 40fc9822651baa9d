use std::ops::Range;

use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{ArborError, PageId, Result};

const FREE_NEXT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;

/// Rewrites `buf` as a free-chain link pointing at `next`.
pub fn write_free_page(buf: &mut [u8], page_id: PageId, page_size: u32, next: PageId) -> Result<()> {
    if buf.len() < FREE_NEXT.end {
        return Err(ArborError::Invalid("free page buffer too small"));
    }
    buf.fill(0);
    PageHeader::new(page_id, PageKind::FreeList, page_size)?.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[FREE_NEXT].copy_from_slice(&next.0.to_be_bytes());
    Ok(())
}

/// Reads the successor link of a free-chain page.
pub fn read_free_next(buf: &[u8], page_id: PageId) -> Result<PageId> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::FreeList {
        return Err(ArborError::Corruption("free chain points at a live page"));
    }
    if header.page_no != page_id {
        return Err(ArborError::Corruption("free page number mismatch"));
    }
    if buf.len() < FREE_NEXT.end {
        return Err(ArborError::Corruption("free page truncated"));
    }
    Ok(PageId(u64::from_be_bytes(page::read_array(&buf[FREE_NEXT])?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_link_roundtrip() {
        let mut buf = vec![0xEEu8; 256];
        write_free_page(&mut buf, PageId(7), 256, PageId(3)).unwrap();
        assert_eq!(read_free_next(&buf, PageId(7)).unwrap(), PageId(3));
        assert!(buf[FREE_NEXT.end..].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_non_free_page() {
        let mut buf = vec![0u8; 256];
        PageHeader::new(PageId(7), PageKind::BTreeLeaf, 256)
            .unwrap()
            .encode(&mut buf)
            .unwrap();
        assert!(read_free_next(&buf, PageId(7)).is_err());
    }

    #[test]
    fn rejects_misplaced_page() {
        let mut buf = vec![0u8; 256];
        write_free_page(&mut buf, PageId(7), 256, PageId::NULL).unwrap();
        assert!(matches!(
            read_free_next(&buf, PageId(8)),
            Err(ArborError::Corruption("free page number mismatch"))
        ));
    }
}
