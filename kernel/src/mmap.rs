// Memory-mapped file records.
//
// One record per live mmap call, kept in the owning process's VM
// state. The record owns the reopened file handle for the lifetime of
// the mapping; the per-page supplemental entries share it. Identifiers
// are system-wide monotonic and never reused.

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::layout::PAGE_SIZE;

/// Mapping identifier returned by mmap, opaque to user code.
pub type MapId = i32;

pub struct Mapping<F> {
    pub id: MapId,
    /// First virtual page of the mapping.
    pub base: VirtAddr,
    /// Pages covered, file length divided by page size rounded up.
    pub page_count: usize,
    /// Descriptor the mapping was created from. Informational; the
    /// record holds its own handle.
    pub fd: i32,
    pub file: Arc<F>,
    /// Length snapshot taken at install time; drives the partial last
    /// page on load and write-back.
    pub file_len: u64,
}

impl<F> Mapping<F> {
    pub fn page(&self, index: usize) -> VirtAddr {
        self.base + (index * PAGE_SIZE) as u64
    }

    /// File bytes present in page `index`; the rest of the page is
    /// zero-fill.
    pub fn read_bytes(&self, index: usize) -> u32 {
        let past = (index * PAGE_SIZE) as u64;
        u64::min(PAGE_SIZE as u64, self.file_len - past) as u32
    }
}

/// Descriptors 0 and 1 are the console and can never be mapped.
pub fn is_reserved_fd(fd: i32) -> bool {
    fd == 0 || fd == 1
}

pub struct MapIdAllocator {
    next: Mutex<MapId>,
}

impl MapIdAllocator {
    pub fn new() -> Self {
        MapIdAllocator { next: Mutex::new(0) }
    }

    pub fn next_id(&self) -> MapId {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }
}
