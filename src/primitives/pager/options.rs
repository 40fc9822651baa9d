use serde::{Deserialize, Serialize};

use crate::types::{page::DEFAULT_PAGE_SIZE, Geometry};

/// How the pager resolves a cache miss.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Read the page inline and hand the buffer back immediately.
    #[default]
    Immediate,
    /// Queue the read; the buffer arrives later as a completion event.
    Deferred,
}

/// How the pager finishes a write-transaction commit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Write back inline; `commit` reports completion.
    #[default]
    Immediate,
    /// Queue the write-back; completion arrives as a confirmation event.
    Deferred,
}

/// Configuration options supplied when creating or opening a [`super::Pager`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerOptions {
    /// Page size in bytes used when formatting a new file.
    pub page_size: u32,
    /// Number of clean, unpinned frames retained after release.
    pub cache_pages: usize,
    /// Miss handling for buffer acquisitions.
    pub io_mode: IoMode,
    /// Completion handling for commits.
    pub commit_mode: CommitMode,
    /// Whether to verify page checksums when loading from the device.
    pub verify_checksums: bool,
    /// Tree geometry written into the superblock of a new file.
    pub geometry: Geometry,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 256,
            io_mode: IoMode::Immediate,
            commit_mode: CommitMode::Immediate,
            verify_checksums: true,
            geometry: Geometry::default(),
        }
    }
}

impl PagerOptions {
    /// Options that force every acquisition and commit through a completion
    /// event: deferred I/O, deferred commit, and no retained frames.
    pub fn fully_deferred() -> Self {
        Self::default()
            .io_mode(IoMode::Deferred)
            .commit_mode(CommitMode::Deferred)
            .cache_pages(0)
    }

    /// Sets the page size used when formatting.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the number of clean frames retained.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Selects how cache misses resolve.
    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    /// Selects how commits complete.
    pub fn commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    /// Enables or disables checksum verification on load.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Sets the geometry used when formatting.
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }
}
