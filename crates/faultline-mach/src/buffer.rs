//! Receive buffer owned by the receiver thread.

use std::collections::TryReserveError;
use std::mem::size_of;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Runtime page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf only reads a system constant and touches no memory of ours.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Round `size` up to a whole number of pages.
pub fn round_to_page(size: usize, page: usize) -> usize {
    debug_assert!(page.is_power_of_two());
    size.saturating_add(page - 1) & !(page - 1)
}

/// A single message buffer, aligned for `mach_msg_header_t`.
///
/// Storage is reserved fallibly so allocation failure can be reported instead
/// of aborting. Dropping the buffer releases it.
#[derive(Debug)]
pub struct ReceiveBuffer {
    words: Vec<u64>,
}

impl ReceiveBuffer {
    pub fn with_size(bytes: usize) -> Result<Self, TryReserveError> {
        let mut words = Vec::new();
        Self::fill(&mut words, bytes)?;
        Ok(Self { words })
    }

    /// Replace the storage with a page-rounded buffer of at least `required`
    /// bytes. The old storage is released first.
    pub fn grow_to(&mut self, required: usize) -> Result<(), TryReserveError> {
        let size = round_to_page(required.max(self.len()), page_size());
        self.words = Vec::new();
        Self::fill(&mut self.words, size)
    }

    fn fill(words: &mut Vec<u64>, bytes: usize) -> Result<(), TryReserveError> {
        let n = bytes.div_ceil(size_of::<u64>());
        words.try_reserve_exact(n)?;
        words.resize(n, 0);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.words.len() * size_of::<u64>()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: u64 storage viewed as initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len()) }
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let len = self.len();
        // SAFETY: as above; unique borrow of the storage.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, len) }
    }
}
