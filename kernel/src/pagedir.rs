// Hardware page-directory capability.
//
// The walker that actually edits page-table entries lives in the
// architecture layer; the paging core only needs this narrow surface.
// `clear_mapping` must also invalidate the TLB entry for the page, and
// the dirty/accessed accessors read the hardware-maintained PTE bits.

use x86_64::{PhysAddr, VirtAddr};

pub trait PageDirectory {
    /// Frame currently mapped at `vaddr`, if any.
    fn get_mapping(&self, vaddr: VirtAddr) -> Option<PhysAddr>;

    /// Maps `vaddr` to `frame`. Returns false if the page-table node
    /// needed for the mapping cannot be allocated.
    fn set_mapping(&mut self, vaddr: VirtAddr, frame: PhysAddr, writable: bool) -> bool;

    /// Removes the mapping and invalidates the TLB entry. The dirty and
    /// accessed bits of the entry are lost; callers that care must read
    /// them first.
    fn clear_mapping(&mut self, vaddr: VirtAddr);

    fn is_dirty(&self, vaddr: VirtAddr) -> bool;

    fn is_accessed(&self, vaddr: VirtAddr) -> bool;

    fn set_accessed(&mut self, vaddr: VirtAddr, accessed: bool);
}
