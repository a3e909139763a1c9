// Filesystem capability consumed by file-backed mappings.
//
// Handles are opaque and positionless here: the paging core only does
// offset-addressed reads and writes. `reopen` yields an independent
// handle on the same inode, so a mapping stays usable after the user
// closes the descriptor it was created from. The syscall dispatcher
// serializes filesystem access; the core never takes that lock itself.

pub trait File: Sized {
    /// Opens an independent handle on the same underlying file.
    fn reopen(&self) -> Self;

    /// Current length in bytes.
    fn length(&self) -> u64;

    /// Reads at `offset` into `buf`, returning the bytes transferred.
    /// Short reads happen at end of file and are not an error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Writes `buf` at `offset`, returning the bytes transferred.
    /// Never extends the file; a write crossing end of file is cut off.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    fn close(self);
}
