//! Page math of an arena and the placement of its bookkeeping pages.
use crate::bookkeeping::Header;

/// Every arena base address is a multiple of this.
pub const REQUIRED_ALIGNMENT: usize = 128 << 20;

/// The largest arena, one full alignment slot.
pub const MAX_SIZE: usize = REQUIRED_ALIGNMENT;

/// Address computations for a fixed page size.
///
/// The bookkeeping of a tracked arena lives in the pages directly below its base address. Its
/// length only depends on the page size: the bitmap always has room for [`MAX_SIZE`] worth of
/// pages. That way the fault path finds it from the faulting address alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    page_size: usize,
}

impl Layout {
    pub(crate) fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Layout { page_size }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// The aligned slot an address falls into.
    pub(crate) fn slot_base(addr: usize) -> usize {
        addr & !(REQUIRED_ALIGNMENT - 1)
    }

    pub(crate) fn is_aligned(addr: usize) -> bool {
        addr & (REQUIRED_ALIGNMENT - 1) == 0
    }

    pub(crate) fn page_count(&self, size: usize) -> usize {
        size.div_ceil(self.page_size)
    }

    pub(crate) fn reserved_len(&self, size: usize) -> usize {
        self.page_count(size) * self.page_size
    }

    pub(crate) fn page_of(&self, base: usize, addr: usize) -> usize {
        (addr - base) / self.page_size
    }

    pub(crate) fn page_addr(&self, base: usize, page: usize) -> usize {
        base + page * self.page_size
    }

    pub(crate) fn bitmap_words(&self) -> usize {
        (MAX_SIZE / self.page_size).div_ceil(64)
    }

    pub(crate) fn bookkeeping_len(&self) -> usize {
        (Header::LEN + 8 * self.bitmap_words()).next_multiple_of(self.page_size)
    }

    pub(crate) fn bookkeeping_addr(&self, base: usize) -> usize {
        base - self.bookkeeping_len()
    }
}
