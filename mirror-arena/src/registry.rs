//! The table of tracked arenas that the fault handler consults.
//!
//! A protection fault only carries an address. The registry turns it back into an arena: the
//! address is masked down to its aligned slot, whose bookkeeping sits right below the base. With
//! validation enabled (debug builds, or the `validate-faults` feature) the slot must also belong
//! to a registered arena, otherwise the fault is declined and travels on to whatever handler was
//! installed before ours.
//!
//! Without validation every fault is assumed to be a first write into an arena. An unrelated
//! access violation will then touch memory that is not bookkeeping and take the process down from
//! within the handler.
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use mirror_vm::{Mapper, Protection};

use crate::bookkeeping::Bookkeeping;
use crate::layout::Layout;
use crate::{Error, ErrorKind};

const VALIDATE_FAULTS: bool = cfg!(any(debug_assertions, feature = "validate-faults"));

static GLOBAL: OnceLock<FaultRegistry> = OnceLock::new();

/// Routes page faults to tracked arenas.
///
/// There is one process-wide instance, [`FaultRegistry::global`], which the installed signal
/// handler dispatches to. Other instances never see a real fault. They exist so that tests, and
/// anyone else who wants to drive tracking by hand, can call [`FaultRegistry::handle_fault`]
/// directly.
pub struct FaultRegistry {
    lock: SpinRwLock,
    slots: [Slot; FaultRegistry::CAPACITY],
    mapper: Mapper,
    layout: Layout,
}

#[derive(Default)]
struct Slot {
    /// Zero for a free slot.
    base: AtomicUsize,
    len: AtomicUsize,
}

impl FaultRegistry {
    /// Maximum number of tracked arenas alive at the same time.
    pub const CAPACITY: usize = 16;

    pub fn new() -> Self {
        Self::with_mapper(Mapper::new())
    }

    /// A registry whose arenas reserve and protect memory through `mapper`.
    pub fn with_mapper(mapper: Mapper) -> Self {
        let layout = Layout::new(mapper.page_size());
        FaultRegistry {
            lock: SpinRwLock::new(),
            slots: core::array::from_fn(|_| Slot::default()),
            mapper,
            layout,
        }
    }

    /// The registry served by the process-wide fault handler.
    pub fn global() -> &'static FaultRegistry {
        GLOBAL.get_or_init(FaultRegistry::new)
    }

    /// The global registry, if anything created it yet.
    ///
    /// A single atomic load, usable from the signal handler.
    pub(crate) fn installed() -> Option<&'static FaultRegistry> {
        GLOBAL.get()
    }

    pub fn is_global(&self) -> bool {
        GLOBAL
            .get()
            .map_or(false, |global| core::ptr::eq(global, self))
    }

    pub fn page_size(&self) -> usize {
        self.layout.page_size()
    }

    /// The number of registered arenas.
    pub fn len(&self) -> usize {
        let _shared = self.lock.read();
        self.slots
            .iter()
            .filter(|slot| slot.base.load(Ordering::Relaxed) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `addr` lies within a registered arena.
    pub fn contains(&self, addr: usize) -> bool {
        let _shared = self.lock.read();
        self.lookup(addr).is_some()
    }

    /// Handle a protection fault at `addr`.
    ///
    /// Marks the page dirty and makes it writable. Returns `false` if the address does not belong
    /// to an arena of this registry, leaving everything untouched.
    pub fn handle_fault(&self, addr: usize) -> bool {
        let base = Layout::slot_base(addr);

        // Declined before the lock, so that a foreign fault on a thread holding it exclusively
        // crashes instead of spinning. Slots only change for arenas nobody can fault in.
        if VALIDATE_FAULTS && self.lookup(addr) != Some(base) {
            return false;
        }

        let _shared = self.lock.read();
        if VALIDATE_FAULTS && self.lookup(addr) != Some(base) {
            return false;
        }

        // Safety: when validating, the slot belongs to a registered arena which keeps its
        // bookkeeping mapped until it is unregistered, and we hold the lock. Otherwise this is the
        // documented leap of faith.
        let book = unsafe {
            Bookkeeping::from_addr(self.layout.bookkeeping_addr(base), self.layout)
        };

        let page = self.layout.page_of(base, addr);
        self.touch(&book, base, page).is_ok()
    }

    /// Mark a page as dirty and writable, as if a write had faulted on it.
    ///
    /// Caller must hold the lock, shared.
    pub(crate) fn touch(&self, book: &Bookkeeping<'_>, base: usize, page: usize) -> Result<(), Error> {
        self.unprotect(book, base, page)?;
        book.mark(page);
        Ok(())
    }

    /// Make a page of a tracked arena writable, without marking it.
    ///
    /// A writable page that is not marked misses its writes until the next snapshot, so callers
    /// mark it or protect it again. Caller must hold the lock, shared.
    pub(crate) fn unprotect(&self, book: &Bookkeeping<'_>, base: usize, page: usize) -> Result<(), Error> {
        if !book.is_valid() {
            return Err(Error::new(ErrorKind::Corrupt, "arena bookkeeping was overwritten"));
        }

        if page >= book.page_count() {
            return Err(Error::new(ErrorKind::InvalidArgument, "page number out of range"));
        }

        let page_size = self.layout.page_size();
        // Safety: the page is part of a live arena.
        unsafe {
            self.mapper
                .protect(self.layout.page_addr(base, page), page_size, Protection::ReadWrite)?
        };

        Ok(())
    }

    pub(crate) fn register(&self, base: usize, len: usize) -> Result<(), Error> {
        let _exclusive = self.lock.write();
        let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.base.load(Ordering::Relaxed) == 0)
        else {
            return Err(Error::new(ErrorKind::OutOfMemory, "fault registry is full"));
        };

        slot.len.store(len, Ordering::Relaxed);
        slot.base.store(base, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn unregister(&self, base: usize) {
        let _exclusive = self.lock.write();
        for slot in &self.slots {
            if slot.base.load(Ordering::Relaxed) == base {
                slot.base.store(0, Ordering::Relaxed);
                slot.len.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Excludes the fault handler, for walking bitmaps and changing protections.
    pub(crate) fn exclusive(&self) -> WriteGuard<'_> {
        self.lock.write()
    }

    pub(crate) fn shared(&self) -> ReadGuard<'_> {
        self.lock.read()
    }

    pub(crate) fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    /// The base of the arena containing `addr`.
    fn lookup(&self, addr: usize) -> Option<usize> {
        self.slots.iter().find_map(|slot| {
            let base = slot.base.load(Ordering::Relaxed);
            let len = slot.len.load(Ordering::Relaxed);
            (base != 0 && addr >= base && addr - base < len).then_some(base)
        })
    }
}

impl Default for FaultRegistry {
    fn default() -> Self {
        FaultRegistry::new()
    }
}

impl core::fmt::Debug for FaultRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FaultRegistry")
            .field("page_size", &self.layout.page_size())
            .field("arenas", &self.len())
            .finish()
    }
}

/// A reader-writer lock of a single atomic.
///
/// Acquiring spins; it never parks or allocates and is therefore usable from within the signal
/// handler. The handler blocks a faulting thread until a snapshot in progress releases its
/// exclusive hold.
///
/// A waiting writer keeps new readers out, so faults can not starve a snapshot. In turn a thread
/// holding the lock shared must not fault on a tracked page: its nested read would wait for the
/// writer, which waits for it.
struct SpinRwLock {
    state: AtomicU32,
}

pub(crate) struct ReadGuard<'lt> {
    lock: &'lt SpinRwLock,
}

pub(crate) struct WriteGuard<'lt> {
    lock: &'lt SpinRwLock,
}

impl SpinRwLock {
    const WRITER: u32 = 1 << 31;
    const PENDING: u32 = 1 << 30;
    const READERS: u32 = Self::PENDING - 1;

    const fn new() -> Self {
        SpinRwLock {
            state: AtomicU32::new(0),
        }
    }

    fn read(&self) -> ReadGuard<'_> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (Self::WRITER | Self::PENDING) == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }

            core::hint::spin_loop();
        }
    }

    fn write(&self) -> WriteGuard<'_> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (Self::WRITER | Self::READERS) == 0 {
                // Free, possibly with our own or another writer's announcement.
                if self
                    .state
                    .compare_exchange_weak(state, Self::WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return WriteGuard { lock: self };
                }
            } else if state & Self::PENDING == 0 {
                self.state.fetch_or(Self::PENDING, Ordering::Relaxed);
            }

            core::hint::spin_loop();
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}
