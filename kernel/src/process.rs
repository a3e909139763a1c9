// Per-process virtual memory state.
//
// Owned by the VM system's process registry and locked as a unit: the
// faulting thread is the only mutator on the fault path, but teardown
// can come from another thread (a parent reaping the process), so the
// whole structure sits behind the registry's per-process mutex.

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::file::File;
use crate::layout::{is_page_aligned, PAGE_SIZE};
use crate::mmap::{MapId, Mapping};
use crate::page::{PageEntry, PageTable};
use crate::pagedir::PageDirectory;
use crate::VmError;

pub type Pid = u32;

pub struct ProcessVm<P, F> {
    pub pid: Pid,
    pub pagedir: P,
    pub pages: PageTable<F>,
    pub mappings: Vec<Mapping<F>>,
}

impl<P: PageDirectory, F: File> ProcessVm<P, F> {
    pub fn new(pid: Pid, pagedir: P) -> Self {
        ProcessVm { pid, pagedir, pages: PageTable::new(), mappings: Vec::new() }
    }

    /// Registers a lazy executable segment: `read_bytes` bytes of
    /// `file` starting at `file_offset`, then `zero_bytes` of bss, laid
    /// out from `upage`. Nothing is loaded until the first fault.
    pub fn register_segment(
        &mut self,
        file: &Arc<F>,
        file_offset: u64,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        debug_assert!((read_bytes + zero_bytes) % PAGE_SIZE == 0);
        if !is_page_aligned(upage) {
            return Err(VmError::MisalignedAddress);
        }

        let mut vpage = upage;
        let mut offset = file_offset;
        let mut remaining = read_bytes;
        let mut pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        while pages > 0 {
            let page_read = usize::min(remaining, PAGE_SIZE);
            let entry = if page_read > 0 {
                PageEntry::file_backed(vpage, file.clone(), offset, page_read as u32, writable)
            } else {
                PageEntry::zeroed(vpage)
            };
            self.pages.insert(entry)?;

            remaining -= page_read;
            offset += page_read as u64;
            vpage += PAGE_SIZE as u64;
            pages -= 1;
        }
        Ok(())
    }

    pub fn mapping_index(&self, id: MapId) -> Option<usize> {
        self.mappings.iter().position(|m| m.id == id)
    }
}
