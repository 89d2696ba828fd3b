use core::sync::atomic::{AtomicU8, Ordering};

use mirror_vm::{Protection, Region};

use crate::bookkeeping::Bookkeeping;
use crate::changes::{ChangeBuffer, ChangeHeader, ChangeKind, HEADER_LEN, PAGE_INDEX_LEN};
use crate::layout::{Layout, MAX_SIZE};
use crate::{trap, Error, ErrorKind, FaultRegistry};

/// How an arena may be accessed, and what a snapshot of it contains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Usage {
    /// Committed read-only. Changes can be applied to it but never retrieved.
    ReadOnly,
    /// Plain memory. A snapshot is a full copy.
    #[default]
    ReadWrite,
    /// Memory whose pages are tracked on first write. A snapshot holds the pages written since
    /// the previous one.
    ReadWriteDiff,
}

/// Configuration of an [`Arena`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArenaDesc {
    /// Where to place the arena, a non-null multiple of [`REQUIRED_ALIGNMENT`].
    ///
    /// [`REQUIRED_ALIGNMENT`]: crate::REQUIRED_ALIGNMENT
    pub base_address: usize,
    /// Size in bytes, at most [`MAX_SIZE`].
    pub size: usize,
    pub usage: Usage,
}

/// A region of memory at a fixed address, with a usage policy.
pub struct Arena {
    /// Released before `memory`, fields drop in order.
    bookkeeping: Option<Region>,
    memory: Region,
    size: usize,
    usage: Usage,
    registry: &'static FaultRegistry,
}

impl Arena {
    /// Create an arena tracked by the process-wide fault handler.
    pub fn new(desc: &ArenaDesc) -> Result<Self, Error> {
        Self::new_in(desc, FaultRegistry::global())
    }

    /// Create an arena in a specific registry.
    ///
    /// Only arenas of [`FaultRegistry::global`] receive real faults. In any other registry a
    /// tracked arena stays read-only until [`FaultRegistry::handle_fault`] is called for its pages.
    pub fn new_in(desc: &ArenaDesc, registry: &'static FaultRegistry) -> Result<Self, Error> {
        let ArenaDesc {
            base_address: base,
            size,
            usage,
        } = *desc;

        if base == 0 || !Layout::is_aligned(base) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "base address is not aligned to the required alignment",
            ));
        }

        if size == 0 || size > MAX_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "arena size is zero or exceeds the maximum",
            ));
        }

        let layout = registry.layout();
        let mapper = registry.mapper();
        let prot = match usage {
            Usage::ReadWrite => Protection::ReadWrite,
            Usage::ReadOnly | Usage::ReadWriteDiff => Protection::Read,
        };

        let memory = mapper.reserve_at(base, layout.reserved_len(size), prot)?;

        let bookkeeping = if usage == Usage::ReadWriteDiff {
            let region = match mapper.reserve_at(
                layout.bookkeeping_addr(base),
                layout.bookkeeping_len(),
                Protection::ReadWrite,
            ) {
                Ok(region) => region,
                Err(err) => {
                    tracing::warn!(base, "bookkeeping allocation failed, releasing arena");
                    drop(memory);
                    return Err(err.into());
                }
            };

            // Safety: freshly mapped, read-write, of the layout's length. Outlived by the region.
            let book = unsafe { Bookkeeping::from_addr(region.addr(), layout) };
            book.initialize(layout.page_count(size));

            if registry.is_global() {
                trap::install()?;
            }

            registry.register(base, memory.len())?;
            Some(region)
        } else {
            None
        };

        tracing::debug!(base, size, ?usage, "created arena");
        Ok(Arena {
            bookkeeping,
            memory,
            size,
            usage,
            registry,
        })
    }

    pub fn base(&self) -> usize {
        self.memory.addr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn registry(&self) -> &'static FaultRegistry {
        self.registry
    }

    pub fn page_size(&self) -> usize {
        self.registry.page_size()
    }

    pub fn page_count(&self) -> usize {
        self.registry.layout().page_count(self.size)
    }

    /// The number of pages a diff would contain right now.
    ///
    /// Without tracking every page of a read-write arena must be assumed dirty. A read-only arena
    /// never has any.
    pub fn dirty_page_count(&self) -> usize {
        match self.usage {
            Usage::ReadOnly => 0,
            Usage::ReadWrite => self.page_count(),
            Usage::ReadWriteDiff => self.bookkeeping().map_or(0, |book| book.dirty_pages()),
        }
    }

    /// A shared view of the arena's bytes.
    ///
    /// Stores into a tracked arena fault once per page and snapshot and then proceed. Stores into
    /// a read-only arena are not handled by anyone and terminate the process.
    pub fn memory(&self) -> &[AtomicU8] {
        // Safety: mapped for as long as we live, at least `size` bytes. Atomics have no
        // uniqueness requirements, and mapped pages are always initialized.
        unsafe { core::slice::from_raw_parts(self.memory.as_ptr() as *const AtomicU8, self.size) }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), Error> {
        if self.usage == Usage::ReadOnly {
            return Err(Error::new(ErrorKind::NotSupported, "read-only arenas can not be written"));
        }

        let target = self.range(offset, data.len())?;
        for (cell, &byte) in target.iter().zip(data) {
            cell.store(byte, Ordering::Relaxed);
        }

        Ok(())
    }

    pub fn read_at(&self, offset: usize, buffer: &mut [u8]) -> Result<(), Error> {
        let source = self.range(offset, buffer.len())?;
        for (byte, cell) in buffer.iter_mut().zip(source) {
            *byte = cell.load(Ordering::Relaxed);
        }

        Ok(())
    }

    /// Write a snapshot into `destination`, or report its size when there is none.
    ///
    /// Returns the length of the change buffer. A read-write arena produces a full copy; a
    /// tracked arena produces its dirty pages in ascending order and starts over with none. The
    /// size reported without a destination stays exact until the next new page is written.
    ///
    /// The destination must be writable memory outside of any tracked arena. A fault while the
    /// registry is held exclusively never resolves: a tracked page waits for the lock forever. In
    /// release builds without the `validate-faults` feature so does any other fault, for example
    /// on a destination inside a read-only arena, instead of terminating the process.
    pub fn retrieve_changes(&self, destination: Option<&mut [u8]>) -> Result<usize, Error> {
        self.check_retrievable()?;
        let _exclusive = self.registry.exclusive();
        self.retrieve_locked(destination)
    }

    /// Allocate and fill a snapshot, without a window for new pages in between.
    pub fn retrieve_changes_vec(&self) -> Result<Vec<u8>, Error> {
        self.check_retrievable()?;
        let _exclusive = self.registry.exclusive();
        let len = self.retrieve_locked(None)?;
        let mut buffer = vec![0; len];
        let written = self.retrieve_locked(Some(&mut buffer))?;
        debug_assert_eq!(len, written);
        Ok(buffer)
    }

    /// Replay a change buffer into this arena.
    ///
    /// The buffer is validated completely before the first byte is written. Pages written into a
    /// tracked arena count as dirty.
    pub fn apply_changes(&self, changes: &[u8]) -> Result<(), Error> {
        let changes = ChangeBuffer::parse(changes)?;
        let memory = self.memory.as_ptr();

        match changes.kind() {
            ChangeKind::Copy => {
                let payload = changes.payload();
                if payload.len() != self.size {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        "full copy does not match the arena size",
                    ));
                }

                self.with_writable(0..self.page_count(), || {
                    // Safety: the arena is writable for `size` bytes, and the payload is not
                    // within it since the arena hands out no byte slices.
                    unsafe { core::ptr::copy_nonoverlapping(payload.as_ptr(), memory, self.size) }
                })?;
            }
            ChangeKind::Diff => {
                let page_size = self.page_size();
                let page_count = self.page_count();
                let pages = changes.diff_pages(page_size)?;

                if pages.clone().any(|(page, _)| page as usize >= page_count) {
                    return Err(Error::new(ErrorKind::InvalidArgument, "page number out of range"));
                }

                let targets = pages.clone().map(|(page, _)| page as usize);
                self.with_writable(targets, || {
                    for (page, bytes) in pages {
                        let offset = page as usize * page_size;
                        // Safety: in range, checked above. Whole pages are mapped.
                        unsafe {
                            core::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.add(offset), page_size)
                        }
                    }
                })?;
            }
        }

        tracing::trace!(base = self.base(), kind = %changes.kind(), "applied changes");
        Ok(())
    }

    fn check_retrievable(&self) -> Result<(), Error> {
        if self.usage == Usage::ReadOnly {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "read-only arenas have no changes to retrieve",
            ));
        }

        Ok(())
    }

    /// Caller holds the registry exclusively.
    fn retrieve_locked(&self, destination: Option<&mut [u8]>) -> Result<usize, Error> {
        match self.usage {
            Usage::ReadOnly => self.check_retrievable().map(|()| 0),
            Usage::ReadWrite => self.retrieve_copy(destination),
            Usage::ReadWriteDiff => self.retrieve_diff(destination),
        }
    }

    fn retrieve_copy(&self, destination: Option<&mut [u8]>) -> Result<usize, Error> {
        let required = HEADER_LEN + self.size;
        let Some(destination) = destination else {
            return Ok(required);
        };

        let (head, payload) = split_destination(destination, required)?;

        // No writer may race the copy.
        self.memory.protect(Protection::Read)?;
        head.copy_from_slice(
            &ChangeHeader {
                payload_len: self.size as u64,
                kind: ChangeKind::Copy,
            }
            .encode(),
        );
        // Safety: readable for `size` bytes; the destination is a distinct allocation.
        unsafe { core::ptr::copy_nonoverlapping(self.memory.as_ptr(), payload.as_mut_ptr(), self.size) };
        self.memory.protect(Protection::ReadWrite)?;

        tracing::trace!(base = self.base(), len = required, "retrieved full copy");
        Ok(required)
    }

    fn retrieve_diff(&self, destination: Option<&mut [u8]>) -> Result<usize, Error> {
        let book = self.checked_bookkeeping()?;
        let page_size = self.page_size();
        let record = PAGE_INDEX_LEN + page_size;
        let required = HEADER_LEN + book.dirty_pages() * record;

        let Some(destination) = destination else {
            return Ok(required);
        };

        let (head, payload) = split_destination(destination, required)?;

        // Every page faults again on its next write, the steady state after a snapshot.
        self.memory.protect(Protection::Read)?;
        head.copy_from_slice(
            &ChangeHeader {
                payload_len: (required - HEADER_LEN) as u64,
                kind: ChangeKind::Diff,
            }
            .encode(),
        );

        let mut records = payload.chunks_exact_mut(record);
        for (page, record) in book.dirty().zip(&mut records) {
            let (index, bytes) = record.split_at_mut(PAGE_INDEX_LEN);
            index.copy_from_slice(&(page as u32).to_le_bytes());
            // Safety: dirty pages are below the page count, whole pages are mapped.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.memory.as_ptr().add(page * page_size),
                    bytes.as_mut_ptr(),
                    page_size,
                )
            };
        }

        debug_assert!(records.next().is_none(), "dirty counter disagrees with bitmap");
        book.clear();

        tracing::trace!(base = self.base(), len = required, "retrieved page diff");
        Ok(required)
    }

    /// Run `write` with the given pages writable, restoring the usage's protection afterwards.
    fn with_writable(
        &self,
        pages: impl Iterator<Item = usize> + Clone,
        write: impl FnOnce(),
    ) -> Result<(), Error> {
        match self.usage {
            Usage::ReadWrite => write(),
            Usage::ReadOnly => {
                self.memory.protect(Protection::ReadWrite)?;
                write();
                self.memory.protect(Protection::Read)?;
            }
            Usage::ReadWriteDiff => {
                // Held until the copy is done, a snapshot must not re-protect the pages between.
                let _shared = self.registry.shared();
                let book = self.checked_bookkeeping()?;
                for (done, page) in pages.clone().enumerate() {
                    if let Err(err) = self.registry.unprotect(&book, self.base(), page) {
                        // A dirty page protected here faults once more and stays marked.
                        for page in pages.clone().take(done) {
                            let _ = self.protect_page(page, Protection::Read);
                        }

                        return Err(err);
                    }
                }

                // Only marked once nothing can fail anymore.
                for page in pages {
                    book.mark(page);
                }

                write();
            }
        }

        Ok(())
    }

    fn protect_page(&self, page: usize, prot: Protection) -> Result<(), Error> {
        let layout = self.registry.layout();
        // Safety: the page belongs to our region, callers pass indices below the page count.
        unsafe {
            self.registry
                .mapper()
                .protect(layout.page_addr(self.base(), page), layout.page_size(), prot)?
        };

        Ok(())
    }

    fn bookkeeping(&self) -> Option<Bookkeeping<'_>> {
        let region = self.bookkeeping.as_ref()?;
        // Safety: mapped by us with the registry's layout, for as long as we live.
        Some(unsafe { Bookkeeping::from_addr(region.addr(), self.registry.layout()) })
    }

    fn checked_bookkeeping(&self) -> Result<Bookkeeping<'_>, Error> {
        match self.bookkeeping() {
            Some(book) if book.is_valid() => Ok(book),
            _ => Err(Error::new(ErrorKind::Corrupt, "arena bookkeeping was overwritten")),
        }
    }

    fn range(&self, offset: usize, len: usize) -> Result<&[AtomicU8], Error> {
        offset
            .checked_add(len)
            .and_then(|end| self.memory().get(offset..end))
            .ok_or(Error::new(ErrorKind::InvalidArgument, "range outside of the arena"))
    }
}

fn split_destination(destination: &mut [u8], required: usize) -> Result<(&mut [u8], &mut [u8]), Error> {
    let Some(destination) = destination.get_mut(..required) else {
        return Err(Error::new(ErrorKind::InvalidArgument, "destination buffer is too small"));
    };

    Ok(destination.split_at_mut(HEADER_LEN))
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.bookkeeping.is_some() {
            self.registry.unregister(self.base());
        }

        tracing::debug!(base = self.base(), "released arena");
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}
