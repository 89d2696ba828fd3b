use alloc::sync::Arc;
use core::ffi::{c_int, c_void};

use crate::Region;

/// A table of OS functions.
///
/// A vtable must contain functions that behave according the POSIX/libc's specification of the
/// correspondingly named functions, see the Safety precondition of [`Mapper::new_unchecked`].
/// Note that a default table can be initialized when linking against `libc`.
///
/// You're encouraged to provide your own objects here instead of hooking the functions themselves
/// with override/linker tricks.
#[non_exhaustive]
pub struct VTable {
    /// Simplified `mmap` of anonymous, private memory placed at `addr`.
    pub mmap: fn(addr: *mut c_void, len: usize, prot: c_int) -> *mut c_void,
    pub mprotect: fn(*mut c_void, usize, c_int) -> c_int,
    pub munmap: fn(*mut c_void, usize) -> c_int,
    pub page_size: fn() -> usize,
    pub errno: fn() -> c_int,

    pub prot_read: c_int,
    pub prot_write: c_int,
    /// The address value `mmap` returns on failure.
    pub map_failed: usize,
    /// Reported when the mapping could not be placed at the requested address.
    pub eexist: c_int,
}

/// Access rights of a range of pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protection {
    Read,
    ReadWrite,
}

#[derive(Clone)]
pub struct Mapper {
    inner: Arc<Inner>,
}

/// An error of the virtual memory functions, the `errno` observed after the call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmError(pub(crate) c_int);

struct Inner {
    vtable: VTable,
    /// Queried once, the OS does not change its mind.
    page_size: usize,
}

impl Mapper {
    /// Create a `Mapper` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain a correct set of functions that implement the `mmap`, `mprotect`
    /// and `munmap` interface. In particular `munmap` must release what `mmap` returned, and
    /// `page_size` must report a power of two.
    pub unsafe fn new_unchecked(vtable: VTable) -> Self {
        let page_size = (vtable.page_size)();
        Mapper {
            inner: Arc::new(Inner { vtable, page_size }),
        }
    }

    #[cfg(feature = "libc")]
    pub fn new() -> Self {
        unsafe { Self::new_unchecked(VTable::new_libc()) }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Reserve and commit `len` bytes exactly at `addr`.
    ///
    /// When the system places the mapping anywhere else it is released again and this fails with
    /// the table's `eexist` code. Any existing mapping at `addr` is never replaced.
    pub fn reserve_at(&self, addr: usize, len: usize, prot: Protection) -> Result<Region, VmError> {
        let vtable = &self.inner.vtable;
        let ptr = (vtable.mmap)(addr as *mut c_void, len, self.prot(prot));

        if ptr as usize == vtable.map_failed {
            return Err(VmError((vtable.errno)()));
        }

        if ptr as usize != addr {
            (vtable.munmap)(ptr, len);
            return Err(VmError(vtable.eexist));
        }

        Ok(Region::new(addr, len, self.clone()))
    }

    /// Change the protection of a page range.
    ///
    /// # Safety
    ///
    /// The range must be owned by the caller. Revoking access to memory still referenced elsewhere
    /// turns those accesses into faults.
    pub unsafe fn protect(&self, addr: usize, len: usize, prot: Protection) -> Result<(), VmError> {
        let vtable = &self.inner.vtable;
        if (vtable.mprotect)(addr as *mut c_void, len, self.prot(prot)) != 0 {
            return Err(VmError((vtable.errno)()));
        }

        Ok(())
    }

    /// Unmap a page range.
    ///
    /// # Safety
    ///
    /// The range must be owned by the caller and must not be accessed afterwards.
    pub unsafe fn release(&self, addr: usize, len: usize) -> Result<(), VmError> {
        let vtable = &self.inner.vtable;
        if (vtable.munmap)(addr as *mut c_void, len) != 0 {
            return Err(VmError((vtable.errno)()));
        }

        Ok(())
    }

    fn prot(&self, prot: Protection) -> c_int {
        let vtable = &self.inner.vtable;
        match prot {
            Protection::Read => vtable.prot_read,
            Protection::ReadWrite => vtable.prot_read | vtable.prot_write,
        }
    }
}

#[cfg(feature = "libc")]
impl Default for Mapper {
    fn default() -> Self {
        Mapper::new()
    }
}

impl VTable {
    #[cfg(feature = "libc")]
    pub fn new_libc() -> Self {
        fn _mmap_inner(addr: *mut c_void, len: usize, prot: c_int) -> *mut c_void {
            // Without the flag (non-Linux, or kernels before 4.17) the address is only a hint. The
            // caller verifies the placement in either case.
            #[cfg(target_os = "linux")]
            let flags = libc::MAP_PRIVATE
                | libc::MAP_ANONYMOUS
                | libc::MAP_NORESERVE
                | libc::MAP_FIXED_NOREPLACE;
            #[cfg(not(target_os = "linux"))]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

            unsafe { libc::mmap(addr, len, prot, flags, -1, 0) }
        }

        fn _mprotect(addr: *mut c_void, len: usize, prot: c_int) -> c_int {
            unsafe { libc::mprotect(addr, len, prot) }
        }

        fn _munmap(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::munmap(addr, len) }
        }

        fn _page_size() -> usize {
            match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                size if size > 0 => size as usize,
                _ => 4096,
            }
        }

        #[cfg(any(target_os = "linux", target_os = "emscripten"))]
        fn _errno() -> c_int {
            unsafe { *libc::__errno_location() }
        }

        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly"
        ))]
        fn _errno() -> c_int {
            unsafe { *libc::__error() }
        }

        #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
        fn _errno() -> c_int {
            unsafe { *libc::__errno() }
        }

        VTable {
            mmap: _mmap_inner,
            mprotect: _mprotect,
            munmap: _munmap,
            page_size: _page_size,
            errno: _errno,
            prot_read: libc::PROT_READ,
            prot_write: libc::PROT_WRITE,
            map_failed: libc::MAP_FAILED as usize,
            eexist: libc::EEXIST,
        }
    }
}

impl VmError {
    /// The raw OS error code.
    pub fn errno(&self) -> c_int {
        self.0
    }
}

impl core::fmt::Debug for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("VmError").field(&self.0).finish()
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "virtual memory operation failed with errno {}", self.0)
    }
}
