//! Owns a mapped range of pages.
use crate::{Mapper, Protection, VmError};

/// A reserved and committed range of pages at a fixed address.
///
/// The region never hands out references into its memory, only the raw pointer. Changing the
/// protection is thus safe from the point of view of this type; whoever dereferences the pointer
/// has to deal with the consequences.
pub struct Region {
    addr: usize,
    len: usize,
    mapper: Mapper,
}

impl Region {
    pub(crate) fn new(addr: usize, len: usize, mapper: Mapper) -> Self {
        Region { addr, len, mapper }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Change the protection of the whole region.
    pub fn protect(&self, prot: Protection) -> Result<(), VmError> {
        // Safety: we own exactly this range.
        unsafe { self.mapper.protect(self.addr, self.len, prot) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Nothing sensible to do on failure, the range stays mapped.
        let _ = unsafe { self.mapper.release(self.addr, self.len) };
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}
