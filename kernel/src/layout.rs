// User address-space layout and page arithmetic.

use x86_64::VirtAddr;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u64 = 12;

/// First kernel virtual address. User addresses are strictly below.
pub const USER_LIMIT: u64 = 0xC000_0000;

/// The user stack grows down from the top of user space.
pub const USER_STACK_TOP: u64 = USER_LIMIT;

/// Maximum stack size. Faults below this floor are never stack growth.
pub const STACK_RESERVE: u64 = 8 * 1024 * 1024;
pub const STACK_FLOOR: u64 = USER_STACK_TOP - STACK_RESERVE;

/// A fault at most this many bytes below the saved user stack pointer
/// is treated as the stack growing (32 covers an x86 PUSHA).
pub const STACK_SLACK: u64 = 32;

pub fn is_user_vaddr(addr: VirtAddr) -> bool {
    addr.as_u64() < USER_LIMIT
}

pub fn is_page_aligned(addr: VirtAddr) -> bool {
    addr.as_u64() % PAGE_SIZE as u64 == 0
}

/// Rounds down to the base of the containing page.
pub fn page_base(addr: VirtAddr) -> VirtAddr {
    VirtAddr::new(addr.as_u64() & !(PAGE_SIZE as u64 - 1))
}

pub fn page_offset(addr: VirtAddr) -> usize {
    (addr.as_u64() & (PAGE_SIZE as u64 - 1)) as usize
}

/// Number of pages needed to cover `len` bytes.
pub fn pages_spanning(len: u64) -> usize {
    (len as usize + PAGE_SIZE - 1) / PAGE_SIZE
}

/// True when a fault at `addr` with saved stack pointer `sp` looks like
/// the user stack growing: inside the stack reserve and no more than
/// `STACK_SLACK` bytes below `sp`.
pub fn plausible_stack_growth(addr: VirtAddr, sp: VirtAddr) -> bool {
    let a = addr.as_u64();
    is_user_vaddr(addr) && a >= STACK_FLOOR && a + STACK_SLACK >= sp.as_u64()
}
