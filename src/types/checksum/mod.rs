#![forbid(unsafe_code)]

use super::page::{self, PAGE_HDR_LEN};
use super::{ArborError, Result};

/// CRC32 over the page number, the file salt, and the page bytes with the
/// CRC field read as zero.
pub fn page_checksum(page_no: u64, salt: u64, data: &[u8]) -> Result<u32> {
    if data.len() < PAGE_HDR_LEN {
        return Err(ArborError::Invalid("page buffer smaller than header"));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(&data[..page::header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[page::header::CRC32.end..]);
    Ok(hasher.finalize())
}

/// Writes the checksum of `data` into its header.
pub fn stamp_page(page_no: u64, salt: u64, data: &mut [u8]) -> Result<()> {
    let crc = page_checksum(page_no, salt, data)?;
    data[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Checks the stored checksum of `data` against its contents.
pub fn verify_page(page_no: u64, salt: u64, data: &[u8]) -> Result<()> {
    let expected = page_checksum(page_no, salt, data)?;
    let stored = u32::from_be_bytes(page::read_array(&data[page::header::CRC32])?);
    if stored != expected {
        return Err(ArborError::Corruption("page checksum mismatch"));
    }
    Ok(())
}
