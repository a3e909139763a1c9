// Supplemental page table.
//
// Per process, one entry per user page the process may touch. The
// entry records where the page's contents can be recovered from while
// it is not resident, and carries the back-reference to the physical
// frame while it is. Exactly one recovery source is valid at any time,
// which the location variant encodes by construction.

use alloc::collections::btree_map::{self, BTreeMap};
use alloc::sync::Arc;
use x86_64::{PhysAddr, VirtAddr};

use crate::file::File;
use crate::layout::page_base;
use crate::swap::SwapSlot;
use crate::VmError;

/// Where a non-resident page's contents live.
#[derive(Clone)]
pub enum PageLocation<F> {
    /// Anonymous page. `slot` is set once the page has been swapped
    /// out; a fresh page that was never evicted has no slot and reads
    /// back as zeros.
    Swap { slot: Option<SwapSlot> },
    /// File-backed page: the first `read_bytes` bytes come from `file`
    /// at `offset`, the tail of the page is zero.
    File {
        file: Arc<F>,
        offset: u64,
        read_bytes: u32,
        writable: bool,
    },
    /// Never-touched zero page with no backing store yet.
    Zero,
}

pub struct PageEntry<F> {
    /// Page-aligned user virtual address, unique within the table.
    pub vpage: VirtAddr,
    pub location: PageLocation<F>,
    /// Backing frame while resident. Non-owning: the frame table entry
    /// holds the authoritative link and this field mirrors it.
    pub frame: Option<PhysAddr>,
    /// Latched copy of the hardware dirty bit. Clearing the hardware
    /// mapping loses the bit, so it is captured here first.
    pub dirty_sticky: bool,
}

impl<F> PageEntry<F> {
    pub fn anonymous(vpage: VirtAddr) -> Self {
        PageEntry { vpage, location: PageLocation::Swap { slot: None }, frame: None, dirty_sticky: false }
    }

    pub fn zeroed(vpage: VirtAddr) -> Self {
        PageEntry { vpage, location: PageLocation::Zero, frame: None, dirty_sticky: false }
    }

    pub fn file_backed(vpage: VirtAddr, file: Arc<F>, offset: u64, read_bytes: u32, writable: bool) -> Self {
        PageEntry {
            vpage,
            location: PageLocation::File { file, offset, read_bytes, writable },
            frame: None,
            dirty_sticky: false,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Hardware write permission for this page. Anonymous and zero
    /// pages are always writable; file pages follow their mapping.
    pub fn writable(&self) -> bool {
        match self.location {
            PageLocation::File { writable, .. } => writable,
            _ => true,
        }
    }
}

/// Associative container from page base to entry, one per process.
pub struct PageTable<F> {
    entries: BTreeMap<u64, PageEntry<F>>,
}

impl<F: File> PageTable<F> {
    pub fn new() -> Self {
        PageTable { entries: BTreeMap::new() }
    }

    pub fn insert(&mut self, entry: PageEntry<F>) -> Result<(), VmError> {
        match self.entries.entry(entry.vpage.as_u64()) {
            btree_map::Entry::Occupied(_) => Err(VmError::DuplicatePage),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Looks up the entry covering `vaddr`, rounding down to its page.
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<&PageEntry<F>> {
        self.entries.get(&page_base(vaddr).as_u64())
    }

    pub fn lookup_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageEntry<F>> {
        self.entries.get_mut(&page_base(vaddr).as_u64())
    }

    /// Removes the entry for `vpage`. Backing frame and swap slot are
    /// untouched; releasing them is the caller's job.
    pub fn remove(&mut self, vpage: VirtAddr) -> Option<PageEntry<F>> {
        self.entries.remove(&vpage.as_u64())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry<F>> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry<F>> {
        core::mem::take(&mut self.entries).into_values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
