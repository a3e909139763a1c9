// System-wide frame table.
//
// Registry of every physical frame currently backing a user page, in
// insertion order. Each entry names the owning process and the user
// page, which is also how the supplemental entry is found again at
// eviction time; the supplemental entry's frame field is the reverse,
// non-owning half of the link.
//
// Two locks. The entry list has its own; on top of it the acquisition
// lock serializes whole alloc-or-evict sequences, so two threads that
// observe an empty pool at the same moment cannot both evict. A frame
// being loaded is not yet listed here and therefore can never be
// chosen as a victim while its fault is in flight.

use alloc::collections::VecDeque;
use spin::{Mutex, MutexGuard};
use x86_64::{PhysAddr, VirtAddr};

use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub frame: PhysAddr,
    pub owner: Pid,
    pub vpage: VirtAddr,
}

pub struct FrameTable {
    entries: Mutex<VecDeque<FrameEntry>>,
    acquire: Mutex<()>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable { entries: Mutex::new(VecDeque::new()), acquire: Mutex::new(()) }
    }

    /// Gate for one alloc-or-evict sequence. Every path that allocates
    /// a user frame, evicts, or walks frames together with process
    /// state must hold this guard for the duration.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.acquire.lock()
    }

    pub fn push(&self, entry: FrameEntry) {
        self.entries.lock().push_back(entry);
    }

    pub fn find(&self, frame: PhysAddr) -> Option<FrameEntry> {
        self.entries.lock().iter().find(|e| e.frame == frame).copied()
    }

    /// Removes and returns the entry for `frame`, if listed.
    pub fn take(&self, frame: PhysAddr) -> Option<FrameEntry> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|e| e.frame == frame)?;
        entries.remove(idx)
    }

    /// Second-chance sweep in insertion order. `referenced` reports
    /// (and should clear) the accessed bit of an entry's page; a
    /// referenced entry is reprieved to the back of the queue once. If
    /// every entry is referenced the sweep degenerates to FIFO and the
    /// head is evicted.
    pub fn pop_victim<R>(&self, mut referenced: R) -> Option<FrameEntry>
    where
        R: FnMut(&FrameEntry) -> bool,
    {
        let mut entries = self.entries.lock();
        for _ in 0..entries.len() {
            let head = entries.pop_front()?;
            if referenced(&head) {
                entries.push_back(head);
            } else {
                return Some(head);
            }
        }
        entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame: u64, vpage: u64) -> FrameEntry {
        FrameEntry { frame: PhysAddr::new(frame), owner: 1, vpage: VirtAddr::new(vpage) }
    }

    #[test]
    fn take_removes_by_frame() {
        let table = FrameTable::new();
        table.push(entry(0x1000, 0x8000));
        table.push(entry(0x2000, 0x9000));
        assert_eq!(table.take(PhysAddr::new(0x1000)), Some(entry(0x1000, 0x8000)));
        assert_eq!(table.take(PhysAddr::new(0x1000)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn victim_skips_referenced_entries() {
        let table = FrameTable::new();
        table.push(entry(0x1000, 0x8000));
        table.push(entry(0x2000, 0x9000));
        table.push(entry(0x3000, 0xA000));

        // First entry gets a second chance, second one is the victim.
        let victim = table.pop_victim(|e| e.frame == PhysAddr::new(0x1000));
        assert_eq!(victim, Some(entry(0x2000, 0x9000)));

        // Reprieved entry rotated behind the third.
        let victim = table.pop_victim(|_| false);
        assert_eq!(victim, Some(entry(0x3000, 0xA000)));
        let victim = table.pop_victim(|_| false);
        assert_eq!(victim, Some(entry(0x1000, 0x8000)));
    }

    #[test]
    fn all_referenced_degenerates_to_fifo() {
        let table = FrameTable::new();
        table.push(entry(0x1000, 0x8000));
        table.push(entry(0x2000, 0x9000));
        let victim = table.pop_victim(|_| true);
        assert_eq!(victim, Some(entry(0x1000, 0x8000)));
    }

    #[test]
    fn empty_table_has_no_victim() {
        let table = FrameTable::new();
        assert_eq!(table.pop_victim(|_| false), None);
    }
}
