// Shared fixtures: a software MMU, a RAM swap disk, files over shared
// byte buffers, and a leaked arena standing in for physical memory.
// User loads and stores go through helpers that fault the page in
// first and then set the accessed/dirty bits the way hardware would.

use std::alloc::{alloc, Layout};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use vm_kernel::block::{BlockDevice, SECTOR_SIZE};
use vm_kernel::frame_alloc::frame_bytes;
use vm_kernel::layout::{page_base, page_offset, PAGE_SIZE, USER_STACK_TOP};
use vm_kernel::{Fault, File, PageDirectory, PhysAddr, Pid, PoolRegion, VirtAddr, VmSystem};

pub type Vm = VmSystem<MemPageDirectory, TestFile, RamDisk>;

/// Stack pointer far above anything the tests touch, so an unmapped
/// access never passes for stack growth by accident.
pub const SP_ANYWHERE: u64 = USER_STACK_TOP;

#[derive(Clone, Copy, Debug)]
pub struct Pte {
    pub frame: PhysAddr,
    pub writable: bool,
    pub dirty: bool,
    pub accessed: bool,
}

/// Software page directory: a map from page base to a mock PTE.
#[derive(Default)]
pub struct MemPageDirectory {
    entries: BTreeMap<u64, Pte>,
}

impl MemPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pte(&self, vaddr: VirtAddr) -> Option<Pte> {
        self.entries.get(&page_base(vaddr).as_u64()).copied()
    }

    /// What the MMU would do on a successful access: set the accessed
    /// bit, and the dirty bit too for a store.
    pub fn touch(&mut self, vaddr: VirtAddr, write: bool) {
        let pte = self
            .entries
            .get_mut(&page_base(vaddr).as_u64())
            .expect("touching an unmapped page");
        pte.accessed = true;
        pte.dirty |= write;
    }
}

impl PageDirectory for MemPageDirectory {
    fn get_mapping(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.entries.get(&page_base(vaddr).as_u64()).map(|pte| pte.frame)
    }

    fn set_mapping(&mut self, vaddr: VirtAddr, frame: PhysAddr, writable: bool) -> bool {
        let key = page_base(vaddr).as_u64();
        assert!(!self.entries.contains_key(&key), "double map at {key:#x}");
        self.entries.insert(key, Pte { frame, writable, dirty: false, accessed: false });
        true
    }

    fn clear_mapping(&mut self, vaddr: VirtAddr) {
        self.entries.remove(&page_base(vaddr).as_u64());
    }

    fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.pte(vaddr).map_or(false, |pte| pte.dirty)
    }

    fn is_accessed(&self, vaddr: VirtAddr) -> bool {
        self.pte(vaddr).map_or(false, |pte| pte.accessed)
    }

    fn set_accessed(&mut self, vaddr: VirtAddr, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&page_base(vaddr).as_u64()) {
            pte.accessed = accessed;
        }
    }
}

/// In-memory swap device.
pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn pages(pages: usize) -> Self {
        RamDisk { sectors: vec![[0; SECTOR_SIZE]; pages * (PAGE_SIZE / SECTOR_SIZE)] }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors.len() as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors[sector as usize]);
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) {
        self.sectors[sector as usize].copy_from_slice(buf);
    }
}

/// A file over a shared byte buffer. `reopen` hands out another handle
/// on the same buffer, like an inode-level reopen.
#[derive(Clone)]
pub struct TestFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl TestFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        TestFile { data: Arc::new(Mutex::new(bytes)) }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl File for TestFile {
    fn reopen(&self) -> Self {
        self.clone()
    }

    fn length(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock().unwrap();
        let start = usize::min(offset as usize, data.len());
        let n = usize::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock().unwrap();
        let len = data.len();
        let start = usize::min(offset as usize, len);
        // Writes never extend the file.
        let n = usize::min(buf.len(), len - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn close(self) {}
}

/// Leaks a page-aligned chunk of heap to play the part of physical
/// memory for one pool region.
pub fn arena(frames: usize) -> PoolRegion {
    let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { alloc(layout) } as u64;
    PoolRegion { start: PhysAddr::new(base), end: PhysAddr::new(base + (frames * PAGE_SIZE) as u64) }
}

pub fn new_vm(frames: usize, swap_pages: usize) -> Vm {
    VmSystem::new(&[arena(frames)], RamDisk::pages(swap_pages))
}

pub fn fault_at(addr: u64, write: bool, sp: u64) -> Fault {
    Fault { addr: VirtAddr::new(addr), write, user: true, sp: VirtAddr::new(sp) }
}

fn ensure_mapped(vm: &Vm, pid: Pid, vaddr: VirtAddr, write: bool) {
    let proc = vm.process(pid).expect("no such process");
    let mapped = proc.lock().pagedir.get_mapping(vaddr).is_some();
    if !mapped {
        vm.handle_fault(pid, &fault_at(vaddr.as_u64(), write, SP_ANYWHERE))
            .expect("fault did not resolve");
    }
}

/// Simulated user store within one page.
pub fn user_store(vm: &Vm, pid: Pid, addr: u64, bytes: &[u8]) {
    let vaddr = VirtAddr::new(addr);
    assert!(page_offset(vaddr) + bytes.len() <= PAGE_SIZE);
    ensure_mapped(vm, pid, vaddr, true);
    let proc = vm.process(pid).unwrap();
    let mut p = proc.lock();
    let frame = p.pagedir.get_mapping(vaddr).unwrap();
    assert!(p.pagedir.pte(vaddr).unwrap().writable, "store through read-only mapping");
    let buf = unsafe { frame_bytes(frame) };
    buf[page_offset(vaddr)..][..bytes.len()].copy_from_slice(bytes);
    p.pagedir.touch(vaddr, true);
}

/// Simulated user load within one page.
pub fn user_load(vm: &Vm, pid: Pid, addr: u64, len: usize) -> Vec<u8> {
    let vaddr = VirtAddr::new(addr);
    assert!(page_offset(vaddr) + len <= PAGE_SIZE);
    ensure_mapped(vm, pid, vaddr, false);
    let proc = vm.process(pid).unwrap();
    let mut p = proc.lock();
    let frame = p.pagedir.get_mapping(vaddr).unwrap();
    let buf = unsafe { frame_bytes(frame) };
    let out = buf[page_offset(vaddr)..][..len].to_vec();
    p.pagedir.touch(vaddr, false);
    out
}
