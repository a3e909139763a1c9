// Fault handler and eviction core.
//
// The system-wide half of the paging machinery: the frame pool, the
// frame table, the swap allocator and the mapping-id counter live
// here, initialized once at boot and passed by reference to whoever
// needs them. Per-process state hangs off the process registry so that
// eviction can reach a victim owned by any process and a parent can
// tear down a child it reaped.
//
// Lock order, outermost first: frame acquisition gate, frame-table
// list, per-process VM state, then the leaf locks (filesystem on the
// far side of the file trait, swap allocator, id counter). The
// registry map lock is only ever held on its own. Any path that
// touches the frame table and process state together runs under the
// gate, which is what makes the pair safe in either order.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::block::BlockDevice;
use crate::file::File;
use crate::frame_alloc::{frame_bytes, AllocFlags, FramePool, PoolRegion};
use crate::frame_table::{FrameEntry, FrameTable};
use crate::layout::{self, page_base, PAGE_SIZE};
use crate::mmap::{is_reserved_fd, MapId, MapIdAllocator, Mapping};
use crate::page::{PageEntry, PageLocation};
use crate::pagedir::PageDirectory;
use crate::process::{Pid, ProcessVm};
use crate::swap::{SwapAllocator, SwapSlot};
use crate::VmError;

/// One page fault as delivered by the trap layer.
pub struct Fault {
    pub addr: VirtAddr,
    /// Access was a write.
    pub write: bool,
    /// Fault came from user mode.
    pub user: bool,
    /// User stack pointer captured in the trap frame.
    pub sp: VirtAddr,
}

type ProcessSlot<P, F> = Arc<Mutex<ProcessVm<P, F>>>;

pub struct VmSystem<P, F, D: BlockDevice> {
    pool: FramePool,
    frames: FrameTable,
    swap: SwapAllocator<D>,
    map_ids: MapIdAllocator,
    processes: Mutex<BTreeMap<Pid, ProcessSlot<P, F>>>,
}

/// Snapshot of a supplemental entry taken under the process lock, so
/// the load itself can run without it.
enum LoadPlan<F> {
    Swap(Option<SwapSlot>),
    File { file: Arc<F>, offset: u64, read_bytes: u32 },
    Zero,
}

impl<P: PageDirectory, F: File, D: BlockDevice> VmSystem<P, F, D> {
    pub fn new(regions: &[PoolRegion], swap_device: D) -> Self {
        VmSystem {
            pool: FramePool::new(regions),
            frames: FrameTable::new(),
            swap: SwapAllocator::new(swap_device),
            map_ids: MapIdAllocator::new(),
            processes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a process's address space with the paging core.
    pub fn attach_process(&self, pid: Pid, pagedir: P) -> ProcessSlot<P, F> {
        let slot = Arc::new(Mutex::new(ProcessVm::new(pid, pagedir)));
        let previous = self.processes.lock().insert(pid, slot.clone());
        debug_assert!(previous.is_none(), "pid {} attached twice", pid);
        slot
    }

    pub fn process(&self, pid: Pid) -> Option<ProcessSlot<P, F>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Resolves a page fault, or reports that the access is invalid
    /// and the process should be terminated with status -1.
    pub fn handle_fault(&self, pid: Pid, fault: &Fault) -> Result<(), VmError> {
        let addr = fault.addr;
        if addr.as_u64() == 0 || !layout::is_user_vaddr(addr) {
            return Err(VmError::InvalidUserAddress);
        }
        let vpage = page_base(addr);
        let proc = self.process(pid).ok_or(VmError::NoSuchProcess)?;

        // Decide how to materialize the page, then drop the process
        // lock: acquiring a frame may evict another page of this same
        // process.
        let (plan, writable) = {
            let mut p = proc.lock();
            match p.pages.lookup(vpage) {
                Some(entry) => {
                    if entry.is_resident() {
                        // Already mapped: a protection violation, not
                        // a missing page.
                        return Err(VmError::InvalidUserAddress);
                    }
                    if fault.write && !entry.writable() {
                        return Err(VmError::InvalidUserAddress);
                    }
                    let plan = match &entry.location {
                        PageLocation::Swap { slot } => LoadPlan::Swap(*slot),
                        PageLocation::File { file, offset, read_bytes, .. } => LoadPlan::File {
                            file: file.clone(),
                            offset: *offset,
                            read_bytes: *read_bytes,
                        },
                        PageLocation::Zero => LoadPlan::Zero,
                    };
                    (plan, entry.writable())
                }
                None => {
                    if !layout::plausible_stack_growth(addr, fault.sp) {
                        return Err(VmError::InvalidUserAddress);
                    }
                    p.pages.insert(PageEntry::anonymous(vpage))?;
                    (LoadPlan::Swap(None), true)
                }
            }
        };

        let _gate = self.frames.acquire();
        let frame = self.alloc_user_frame();
        match plan {
            LoadPlan::Swap(Some(slot)) => {
                self.swap.read(slot, frame);
                self.swap.release(slot);
            }
            // A fresh anonymous or zero page is satisfied by the
            // zeroed frame itself.
            LoadPlan::Swap(None) | LoadPlan::Zero => {}
            LoadPlan::File { file, offset, read_bytes } => {
                let handle = file.reopen();
                let buf = unsafe { frame_bytes(frame) };
                let n = handle.read_at(&mut buf[..read_bytes as usize], offset);
                // The tail past `n` is already zero from allocation.
                if n < read_bytes as usize {
                    log::warn!("short mmap read: {} of {} bytes at {:#x}", n, read_bytes, offset);
                }
                handle.close();
            }
        }
        self.link_resident(&proc, pid, vpage, frame, writable);
        Ok(())
    }

    /// Creates and installs one fresh anonymous stack page at `addr`.
    /// Exposed for the dispatcher, whose argument validation can run
    /// into not-yet-grown stack addresses.
    pub fn grow_stack(&self, pid: Pid, addr: VirtAddr) -> Result<(), VmError> {
        if !layout::is_user_vaddr(addr) || addr.as_u64() < layout::STACK_FLOOR {
            return Err(VmError::InvalidUserAddress);
        }
        let vpage = page_base(addr);
        let proc = self.process(pid).ok_or(VmError::NoSuchProcess)?;
        proc.lock().pages.insert(PageEntry::anonymous(vpage))?;

        let _gate = self.frames.acquire();
        let frame = self.alloc_user_frame();
        self.link_resident(&proc, pid, vpage, frame, true);
        Ok(())
    }

    /// Maps the whole of `file` at `base`, one supplemental entry per
    /// page, and returns the mapping id. The record holds its own
    /// reopened handle so the caller may close `fd` afterwards.
    pub fn mmap(&self, pid: Pid, base: VirtAddr, fd: i32, file: &F) -> Result<MapId, VmError> {
        if base.as_u64() == 0 || !layout::is_user_vaddr(base) {
            return Err(VmError::InvalidUserAddress);
        }
        if !layout::is_page_aligned(base) {
            return Err(VmError::MisalignedAddress);
        }
        if is_reserved_fd(fd) {
            return Err(VmError::ReservedDescriptor);
        }
        let proc = self.process(pid).ok_or(VmError::NoSuchProcess)?;
        let mut p = proc.lock();

        let file_len = file.length();
        let page_count = layout::pages_spanning(file_len);
        if base.as_u64() + (page_count * PAGE_SIZE) as u64 > layout::USER_LIMIT {
            return Err(VmError::InvalidUserAddress);
        }
        // Every candidate page must be free in both the supplemental
        // table and the hardware directory, or nothing is touched.
        for i in 0..page_count {
            let vpage = base + (i * PAGE_SIZE) as u64;
            if p.pages.lookup(vpage).is_some() || p.pagedir.get_mapping(vpage).is_some() {
                return Err(VmError::MapConflict);
            }
        }

        let handle = Arc::new(file.reopen());
        let id = self.map_ids.next_id();
        let mapping = Mapping { id, base, page_count, fd, file: handle.clone(), file_len };
        for i in 0..page_count {
            let entry = PageEntry::file_backed(
                mapping.page(i),
                handle.clone(),
                (i * PAGE_SIZE) as u64,
                mapping.read_bytes(i),
                true,
            );
            p.pages.insert(entry).expect("mapped page raced past the overlap check");
        }
        log::debug!("mmap: id {} covers {:#x} +{} pages", id, base.as_u64(), page_count);
        p.mappings.push(mapping);
        Ok(id)
    }

    /// Tears down the mapping `id` if this process owns it: resident
    /// pages are evicted (writing dirty ones back to the file), the
    /// supplemental entries removed, the record destroyed. An unknown
    /// id is a silent no-op.
    pub fn munmap(&self, pid: Pid, id: MapId) -> Result<(), VmError> {
        let proc = self.process(pid).ok_or(VmError::NoSuchProcess)?;
        let _gate = self.frames.acquire();
        let mut p = proc.lock();
        let Some(index) = p.mapping_index(id) else {
            return Ok(());
        };
        let mapping = p.mappings.remove(index);
        self.unmap_pages(&mut p, &mapping);
        let Mapping { file, .. } = mapping;
        if let Ok(handle) = Arc::try_unwrap(file) {
            handle.close();
        }
        Ok(())
    }

    /// Process-exit hook. Mappings are drained first since their pages
    /// may owe the filesystem a write; after that anonymous contents
    /// die with the address space, so resident frames and swap slots
    /// are simply released.
    pub fn detach_process(&self, pid: Pid) {
        let Some(proc) = self.process(pid) else {
            return;
        };
        {
            let _gate = self.frames.acquire();
            let mut p = proc.lock();
            while let Some(mapping) = p.mappings.pop() {
                self.unmap_pages(&mut p, &mapping);
                let Mapping { file, .. } = mapping;
                if let Ok(handle) = Arc::try_unwrap(file) {
                    handle.close();
                }
            }

            let vpages: Vec<VirtAddr> = p.pages.iter().map(|e| e.vpage).collect();
            for vpage in vpages {
                let resident = p.pages.lookup(vpage).and_then(|e| e.frame);
                if let Some(frame) = resident {
                    let taken = self.frames.take(frame);
                    debug_assert!(taken.is_some(), "resident frame missing from frame table");
                    self.write_back(&mut p, &FrameEntry { frame, owner: pid, vpage }, true);
                    self.pool.free(frame);
                }
                if let Some(entry) = p.pages.remove(vpage) {
                    if let PageLocation::Swap { slot: Some(slot) } = entry.location {
                        self.swap.release(slot);
                    }
                }
            }
        }
        // Unregister only once no frame can name this process anymore;
        // a concurrent evictor must always be able to reach the owner.
        self.processes.lock().remove(&pid);
    }

    pub fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    pub fn resident_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.used_slots()
    }

    pub fn frame_entry(&self, frame: PhysAddr) -> Option<FrameEntry> {
        self.frames.find(frame)
    }

    /// Allocates a zeroed user frame, evicting a victim if the pool is
    /// dry. The acquisition gate must be held.
    fn alloc_user_frame(&self) -> PhysAddr {
        let flags = AllocFlags::USER | AllocFlags::ZERO;
        if let Some(frame) = self.pool.alloc(flags) {
            return frame;
        }
        let victim = self.select_victim().expect("out of frames with nothing to evict");
        log::debug!("evicting {:#x} of pid {}", victim.vpage.as_u64(), victim.owner);
        self.evict(victim);
        self.pool.alloc(flags).expect("frame pool empty after eviction")
    }

    /// Second-chance selection: referenced pages lose their accessed
    /// bit and go to the back of the queue.
    fn select_victim(&self) -> Option<FrameEntry> {
        self.frames.pop_victim(|e| {
            let Some(proc) = self.process(e.owner) else {
                return false;
            };
            let mut p = proc.lock();
            if p.pagedir.is_accessed(e.vpage) {
                p.pagedir.set_accessed(e.vpage, false);
                true
            } else {
                false
            }
        })
    }

    /// Evicts a victim already removed from the frame table.
    fn evict(&self, victim: FrameEntry) {
        let proc = self.process(victim.owner).expect("victim frame owned by dead process");
        let mut p = proc.lock();
        self.write_back(&mut p, &victim, false);
        self.pool.free(victim.frame);
    }

    /// Releases every page of a mapping, evicting resident ones with
    /// write-back. Gate and process lock are held by the caller.
    fn unmap_pages(&self, p: &mut ProcessVm<P, F>, mapping: &Mapping<F>) {
        for i in 0..mapping.page_count {
            let vpage = mapping.page(i);
            let resident = p.pages.lookup(vpage).and_then(|e| e.frame);
            if let Some(frame) = resident {
                let taken = self.frames.take(frame);
                debug_assert!(taken.is_some(), "resident frame missing from frame table");
                self.write_back(p, &FrameEntry { frame, owner: p.pid, vpage }, false);
                self.pool.free(frame);
            }
            let removed = p.pages.remove(vpage);
            debug_assert!(removed.is_some(), "mapping page missing from supplemental table");
        }
    }

    /// Pushes a victim's contents to its backing store and severs the
    /// residency links. The caller frees the frame afterwards.
    ///
    /// With `discarding` set the address space is going away: anonymous
    /// and zero pages are dropped without touching swap, while dirty
    /// file pages are still written out.
    fn write_back(&self, p: &mut ProcessVm<P, F>, victim: &FrameEntry, discarding: bool) {
        // Observe the dirty bit first; clearing the mapping loses it.
        let hw_dirty = p.pagedir.is_dirty(victim.vpage);
        p.pagedir.clear_mapping(victim.vpage);

        let entry = p
            .pages
            .lookup_mut(victim.vpage)
            .expect("evicting a frame with no supplemental entry");
        debug_assert_eq!(entry.frame, Some(victim.frame));
        entry.dirty_sticky |= hw_dirty;
        entry.frame = None;

        match &mut entry.location {
            PageLocation::Swap { slot } => {
                if !discarding {
                    let s = self.swap.write(victim.frame).expect("swap device full");
                    *slot = Some(s);
                }
            }
            PageLocation::File { file, offset, read_bytes, .. } => {
                if entry.dirty_sticky {
                    let handle = file.reopen();
                    let buf = unsafe { frame_bytes(victim.frame) };
                    let n = handle.write_at(&buf[..*read_bytes as usize], *offset);
                    if n != *read_bytes as usize {
                        log::warn!("short write-back: {} of {} bytes at {:#x}", n, read_bytes, offset);
                    }
                    handle.close();
                }
            }
            PageLocation::Zero => {
                // A zero page that was written becomes an ordinary
                // anonymous page; untouched ones are dropped silently.
                if entry.dirty_sticky && !discarding {
                    let s = self.swap.write(victim.frame).expect("swap device full");
                    entry.location = PageLocation::Swap { slot: Some(s) };
                }
            }
        }
    }

    /// Final step of a fault: registers the frame, links it to the
    /// supplemental entry and installs the hardware mapping. The
    /// acquisition gate must be held.
    fn link_resident(
        &self,
        proc: &ProcessSlot<P, F>,
        pid: Pid,
        vpage: VirtAddr,
        frame: PhysAddr,
        writable: bool,
    ) {
        self.frames.push(FrameEntry { frame, owner: pid, vpage });
        let mut p = proc.lock();
        let entry = p.pages.lookup_mut(vpage).expect("faulting page vanished during load");
        if let PageLocation::Swap { slot } = &mut entry.location {
            // Contents are resident again; the slot was released.
            *slot = None;
        }
        entry.frame = Some(frame);
        let installed = p.pagedir.set_mapping(vpage, frame, writable);
        assert!(installed, "hardware install failed at {:#x}", vpage.as_u64());
    }
}
