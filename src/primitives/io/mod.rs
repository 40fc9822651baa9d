#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::types::{ArborError, Result};

/// Positioned block device the pager reads pages from and writes them to.
///
/// Offsets are byte offsets; the pager only ever issues whole pages.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`. Reading past the end is an
    /// [`ErrorKind::UnexpectedEof`] I/O error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes `src` at `off`, growing the device as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Makes every prior write durable.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// True before anything has been written.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or zero-extends to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub(super) fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub(super) fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub(super) fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub(super) fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

#[cfg(not(any(unix, windows)))]
mod positioned {
    use std::{
        fs::File,
        io::{self, Read, Seek, SeekFrom, Write},
    };

    // Callers serialize device access, so seek + read is not raced.
    pub(super) fn read(mut file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek(SeekFrom::Start(off))?;
        file.read(dst)
    }

    pub(super) fn write(mut file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek(SeekFrom::Start(off))?;
        file.write(src)
    }
}

/// Page file on the local filesystem.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open handle. It must be readable and writable.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it if missing. Existing contents
    /// are kept; formatting truncates explicitly.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = positioned::read(&self.file, dst, off)?;
            if read == 0 {
                return Err(ArborError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read past end of page file",
                )));
            }
            dst = &mut std::mem::take(&mut dst)[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = positioned::write(&self.file, src, off)?;
            if written == 0 {
                return Err(ArborError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "page file accepted no bytes",
                )));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}

/// Growable in-memory image standing in for a page file.
#[derive(Clone, Default)]
pub struct MemFileIo {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty image.
    pub fn new() -> Self {
        Self::default()
    }
}

fn span(off: u64, len: usize) -> Result<(usize, usize)> {
    let start = usize::try_from(off).map_err(|_| ArborError::Invalid("offset overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or(ArborError::Invalid("offset overflow"))?;
    Ok((start, end))
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let (start, end) = span(off, dst.len())?;
        if end > bytes.len() {
            return Err(ArborError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of image",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let (start, end) = span(off, src.len())?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| ArborError::Invalid("length overflow"))?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }
}
