// Swap-slot allocator.
//
// The swap device is carved into page-sized slots of eight sectors
// each, tracked by a bitmap. One lock covers both bitmap mutation and
// the device I/O for the affected run, so a slot can never be observed
// allocated with stale contents. Transfers are synchronous, one page
// at a time.

use alloc::vec::Vec;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::block::{BlockDevice, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::frame_alloc::frame_bytes;
use crate::VmError;

/// Index of one page-sized run on the swap device.
pub type SwapSlot = u32;

struct SwapInner<D> {
    device: D,
    bitmap: Vec<u64>,
    total_slots: usize,
    used_slots: usize,
}

pub struct SwapAllocator<D: BlockDevice> {
    inner: Mutex<SwapInner<D>>,
}

impl<D: BlockDevice> SwapAllocator<D> {
    pub fn new(device: D) -> Self {
        let total = (device.sector_count() / SECTORS_PER_PAGE) as usize;
        log::info!("swap: {} slots ({} KiB)", total, total * 4);
        SwapAllocator {
            inner: Mutex::new(SwapInner {
                device,
                bitmap: alloc::vec![0; (total + 63) / 64],
                total_slots: total,
                used_slots: 0,
            }),
        }
    }

    /// Copies one page out of `frame` into a fresh slot.
    pub fn write(&self, frame: PhysAddr) -> Result<SwapSlot, VmError> {
        let mut swap = self.inner.lock();
        let slot = swap.alloc_slot().ok_or(VmError::OutOfSwap)?;
        let bytes = unsafe { frame_bytes(frame) };
        for (s, chunk) in bytes.chunks_exact(SECTOR_SIZE).enumerate() {
            swap.device.write_sector(slot as u64 * SECTORS_PER_PAGE + s as u64, chunk);
        }
        log::debug!("swap: page-out {:#x} -> slot {}", frame.as_u64(), slot);
        Ok(slot)
    }

    /// Copies a slot's contents into `frame`. The slot stays allocated;
    /// release it once the page is resident again.
    pub fn read(&self, slot: SwapSlot, frame: PhysAddr) {
        let mut swap = self.inner.lock();
        debug_assert!(swap.is_allocated(slot), "reading free swap slot {}", slot);
        let bytes = unsafe { frame_bytes(frame) };
        for (s, chunk) in bytes.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            swap.device.read_sector(slot as u64 * SECTORS_PER_PAGE + s as u64, chunk);
        }
        log::debug!("swap: page-in slot {} -> {:#x}", slot, frame.as_u64());
    }

    pub fn release(&self, slot: SwapSlot) {
        let mut swap = self.inner.lock();
        debug_assert!(swap.is_allocated(slot), "releasing free swap slot {}", slot);
        swap.bitmap[slot as usize / 64] &= !(1 << (slot % 64));
        swap.used_slots -= 1;
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used_slots
    }

    pub fn total_slots(&self) -> usize {
        self.inner.lock().total_slots
    }
}

impl<D> SwapInner<D> {
    fn alloc_slot(&mut self) -> Option<SwapSlot> {
        for n in 0..self.total_slots {
            if self.bitmap[n / 64] & (1 << (n % 64)) == 0 {
                self.bitmap[n / 64] |= 1 << (n % 64);
                self.used_slots += 1;
                return Some(n as SwapSlot);
            }
        }
        None
    }

    fn is_allocated(&self, slot: SwapSlot) -> bool {
        (slot as usize) < self.total_slots
            && self.bitmap[slot as usize / 64] & (1 << (slot % 64)) != 0
    }
}
