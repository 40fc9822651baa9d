use parking_lot::RwLock;
use std::sync::Arc;

/// Shared page bytes handed out to buffers.
pub type PageBytes = Arc<RwLock<Box<[u8]>>>;

/// Cache slot for one resident page.
pub struct Frame {
    pub buf: PageBytes,
    pub pin_count: u32,
    pub dirty: bool,
}

impl Frame {
    pub fn zeroed(page_size: usize) -> Self {
        Self::from_bytes(vec![0u8; page_size].into_boxed_slice())
    }

    pub fn from_bytes(bytes: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(bytes)),
            pin_count: 0,
            dirty: false,
        }
    }

    /// Frames that may be dropped from the cache without losing data.
    pub fn is_evictable(&self) -> bool {
        self.pin_count == 0 && !self.dirty
    }
}
