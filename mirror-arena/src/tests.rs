use crate::bookkeeping::Bookkeeping;
use crate::layout::Layout;
use crate::{
    change_buffer_len, Arena, ArenaDesc, ChangeBuffer, ChangeHeader, ChangeKind, ErrorKind,
    FaultRegistry, Usage, HEADER_LEN, PAGE_INDEX_LEN, REQUIRED_ALIGNMENT,
};

use core::ffi::{c_int, c_void};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use mirror_vm::{Mapper, VTable};

#[test]
fn layout_of_small_pages() {
    let layout = Layout::new(4096);
    assert_eq!(layout.bitmap_words(), 512);
    assert_eq!(layout.bookkeeping_len(), 2 * 4096);
    assert_eq!(layout.page_count(1), 1);
    assert_eq!(layout.page_count(4096), 1);
    assert_eq!(layout.page_count(4097), 2);
    assert_eq!(layout.reserved_len(4097), 8192);

    let base = 3 * REQUIRED_ALIGNMENT;
    assert_eq!(Layout::slot_base(base + 1_000_000), base);
    assert_eq!(layout.page_of(base, base + 1_000_000), 244);
    assert_eq!(layout.bookkeeping_addr(base), base - 8192);
    assert!(Layout::is_aligned(base));
    assert!(!Layout::is_aligned(base + 4096));
}

#[test]
fn bookkeeping_counts_distinct_pages() {
    let layout = Layout::new(4096);
    let mut backing = vec![0u64; layout.bookkeeping_len() / 8];
    let book = unsafe { Bookkeeping::from_addr(backing.as_mut_ptr() as usize, layout) };

    assert!(!book.is_valid());
    book.initialize(100);
    assert!(book.is_valid());
    assert_eq!(book.page_count(), 100);

    assert!(book.mark(3));
    assert!(!book.mark(3));
    assert!(book.mark(64));
    assert!(book.mark(99));
    assert_eq!(book.dirty_pages(), 3);
    assert_eq!(book.dirty().collect::<Vec<_>>(), [3, 64, 99]);

    book.clear();
    assert_eq!(book.dirty_pages(), 0);
    assert_eq!(book.dirty().count(), 0);
}

#[test]
fn rejects_bad_descriptions() {
    with_registry(|registry| {
        let size = registry.page_size();
        let bad = [
            ArenaDesc {
                base_address: 0,
                size,
                usage: Usage::ReadWriteDiff,
            },
            ArenaDesc {
                base_address: base(0) + registry.page_size(),
                size,
                usage: Usage::ReadWriteDiff,
            },
            ArenaDesc {
                base_address: base(0),
                size: REQUIRED_ALIGNMENT + 1,
                usage: Usage::ReadWrite,
            },
            ArenaDesc {
                base_address: base(0),
                size: 0,
                usage: Usage::ReadOnly,
            },
        ];

        for desc in &bad {
            let err = Arena::new_in(desc, registry).expect_err("invalid description");
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{desc:?}");
        }

        assert!(registry.is_empty());
        // Nothing was mapped, the slot is still free.
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(0),
                size,
                usage: Usage::ReadWrite,
            },
            registry,
        );
        assert!(arena.is_ok());
    });
}

#[test]
fn simulated_faults_track_pages() {
    with_registry(|registry| {
        let page = registry.page_size();
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(1),
                size: 64 * page,
                usage: Usage::ReadWriteDiff,
            },
            registry,
        )
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(arena.base() + 5 * page));
        assert_eq!(arena.dirty_page_count(), 0);

        write_tracked(&arena, 0, b"first");
        write_tracked(&arena, 5 * page + 7, b"second");
        write_tracked(&arena, 5 * page + 100, b"again");
        assert_eq!(arena.dirty_page_count(), 2);

        let changes = arena.retrieve_changes_vec().unwrap();
        assert_eq!(changes.len(), HEADER_LEN + 2 * (PAGE_INDEX_LEN + page));
        assert_eq!(arena.dirty_page_count(), 0);

        let buffer = ChangeBuffer::parse(&changes).unwrap();
        assert_eq!(buffer.kind(), ChangeKind::Diff);
        let pages: Vec<_> = buffer.diff_pages(page).unwrap().collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].0, 0);
        assert_eq!(&pages[0].1[..5], b"first");
        assert_eq!(pages[1].0, 5);
        assert_eq!(&pages[1].1[7..13], b"second");
        assert_eq!(&pages[1].1[100..105], b"again");

        drop(arena);
        assert!(registry.is_empty());
    });
}

#[cfg(debug_assertions)]
#[test]
fn declines_foreign_faults() {
    with_registry(|registry| {
        let page = registry.page_size();
        assert!(!registry.handle_fault(base(2)));

        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(2),
                size: 4 * page,
                usage: Usage::ReadWriteDiff,
            },
            registry,
        )
        .unwrap();

        // Within the aligned slot, but past the arena.
        assert!(!registry.handle_fault(arena.base() + 4 * page));
        assert!(registry.handle_fault(arena.base() + 3 * page));
        assert_eq!(arena.dirty_page_count(), 1);
    });
}

#[test]
fn rolls_back_when_bookkeeping_fails() {
    static RESERVED: AtomicUsize = AtomicUsize::new(0);
    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    fn _mmap(addr: *mut c_void, len: usize, prot: c_int) -> *mut c_void {
        // The arena itself succeeds, its bookkeeping does not.
        if RESERVED.fetch_add(1, Ordering::Relaxed) == 1 {
            return libc::MAP_FAILED;
        }

        unsafe { libc::mmap(addr, len, prot, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0) }
    }

    fn _munmap(addr: *mut c_void, len: usize) -> c_int {
        RELEASED.fetch_add(1, Ordering::Relaxed);
        unsafe { libc::munmap(addr, len) }
    }

    fn _enomem() -> c_int {
        libc::ENOMEM
    }

    let mut vtable = VTable::new_libc();
    vtable.mmap = _mmap;
    vtable.munmap = _munmap;
    vtable.errno = _enomem;

    let mapper = unsafe { Mapper::new_unchecked(vtable) };
    let registry: &'static FaultRegistry = Box::leak(Box::new(FaultRegistry::with_mapper(mapper)));
    let desc = ArenaDesc {
        base_address: base(3),
        size: 8 * registry.page_size(),
        usage: Usage::ReadWriteDiff,
    };

    let err = Arena::new_in(&desc, registry).expect_err("bookkeeping allocation fails");
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    assert_eq!(RESERVED.load(Ordering::Relaxed), 2);
    assert_eq!(RELEASED.load(Ordering::Relaxed), 1);
    assert!(registry.is_empty());

    // The arena's range was given back.
    let arena = Arena::new_in(&desc, registry).unwrap();
    assert_eq!(arena.base(), base(3));
}

#[test]
fn failed_protection_marks_nothing() {
    fn _mprotect(_: *mut c_void, _: usize, _: c_int) -> c_int {
        -1
    }

    fn _eacces() -> c_int {
        libc::EACCES
    }

    let mut vtable = VTable::new_libc();
    vtable.mprotect = _mprotect;
    vtable.errno = _eacces;

    let mapper = unsafe { Mapper::new_unchecked(vtable) };
    let registry: &'static FaultRegistry = Box::leak(Box::new(FaultRegistry::with_mapper(mapper)));
    let page = registry.page_size();
    let arena = Arena::new_in(
        &ArenaDesc {
            base_address: base(30),
            size: 4 * page,
            usage: Usage::ReadWriteDiff,
        },
        registry,
    )
    .unwrap();

    let err = arena
        .apply_changes(&diff_buffer(page, &[(1, 0xcc)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    assert_eq!(arena.dirty_page_count(), 0);
    assert_eq!(arena.memory()[page].load(Ordering::Relaxed), 0);

    assert!(!registry.handle_fault(arena.base() + 2 * page));
    assert_eq!(arena.dirty_page_count(), 0);
}

#[test]
fn failed_apply_protects_pages_again() {
    static PROTECTS: AtomicUsize = AtomicUsize::new(0);

    fn _mprotect(addr: *mut c_void, len: usize, prot: c_int) -> c_int {
        // The second page of the apply can not be made writable.
        if PROTECTS.fetch_add(1, Ordering::Relaxed) == 1 {
            return -1;
        }

        unsafe { libc::mprotect(addr, len, prot) }
    }

    fn _eacces() -> c_int {
        libc::EACCES
    }

    let mut vtable = VTable::new_libc();
    vtable.mprotect = _mprotect;
    vtable.errno = _eacces;

    let mapper = unsafe { Mapper::new_unchecked(vtable) };
    let registry: &'static FaultRegistry = Box::leak(Box::new(FaultRegistry::with_mapper(mapper)));
    let page = registry.page_size();
    let arena = Arena::new_in(
        &ArenaDesc {
            base_address: base(31),
            size: 4 * page,
            usage: Usage::ReadWriteDiff,
        },
        registry,
    )
    .unwrap();

    let err = arena
        .apply_changes(&diff_buffer(page, &[(1, 0xcc), (2, 0xdd)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    // Page 1 writable, page 2 refused, page 1 read-only again.
    assert_eq!(PROTECTS.load(Ordering::Relaxed), 3);
    assert_eq!(arena.dirty_page_count(), 0);
    assert_eq!(arena.memory()[page].load(Ordering::Relaxed), 0);

    // Nothing is left half-done, the same buffer applies now.
    arena
        .apply_changes(&diff_buffer(page, &[(1, 0xcc), (2, 0xdd)]))
        .unwrap();
    assert_eq!(arena.dirty_page_count(), 2);
    assert_eq!(arena.memory()[2 * page].load(Ordering::Relaxed), 0xdd);
}

#[test]
fn snapshots_are_not_starved_by_faults() {
    with_registry(|registry| {
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        let _shared = registry.shared();
                        for _ in 0..64 {
                            core::hint::spin_loop();
                        }
                    }
                });
            }

            for _ in 0..100 {
                drop(registry.exclusive());
            }

            stop.store(true, Ordering::Relaxed);
        });
    });
}

#[cfg(debug_assertions)]
#[test]
fn foreign_faults_do_not_wait_for_the_lock() {
    with_registry(|registry| {
        let _exclusive = registry.exclusive();
        assert!(!registry.handle_fault(base(32) + 100));
    });
}

#[test]
fn detects_clobbered_bookkeeping() {
    with_registry(|registry| {
        let page = registry.page_size();
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(4),
                size: 4 * page,
                usage: Usage::ReadWriteDiff,
            },
            registry,
        )
        .unwrap();

        write_tracked(&arena, 0, b"data");
        let layout = Layout::new(page);
        unsafe { (layout.bookkeeping_addr(arena.base()) as *mut u32).write(0) };

        let err = arena.retrieve_changes(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(!registry.handle_fault(arena.base() + page));
    });
}

#[test]
fn registry_is_bounded() {
    with_registry(|registry| {
        let page = registry.page_size();
        let desc = |slot| ArenaDesc {
            base_address: base(slot),
            size: page,
            usage: Usage::ReadWriteDiff,
        };

        let arenas: Vec<_> = (0..FaultRegistry::CAPACITY)
            .map(|idx| Arena::new_in(&desc(10 + idx), registry).unwrap())
            .collect();
        assert_eq!(registry.len(), FaultRegistry::CAPACITY);

        let overflow = desc(10 + FaultRegistry::CAPACITY);
        let err = Arena::new_in(&overflow, registry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        drop(arenas);
        assert!(registry.is_empty());
        assert!(Arena::new_in(&overflow, registry).is_ok());
    });
}

#[test]
fn read_only_arena() {
    with_registry(|registry| {
        let page = registry.page_size();
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(5),
                size: 2 * page,
                usage: Usage::ReadOnly,
            },
            registry,
        )
        .unwrap();

        assert_eq!(arena.dirty_page_count(), 0);
        assert_eq!(arena.retrieve_changes(None).unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(arena.write_at(0, b"x").unwrap_err().kind(), ErrorKind::NotSupported);

        let mut copy = ChangeHeader {
            payload_len: 2 * page as u64,
            kind: ChangeKind::Copy,
        }
        .encode()
        .to_vec();
        copy.extend((0..2 * page).map(|idx| idx as u8));
        arena.apply_changes(&copy).unwrap();

        let mut back = vec![0; 2 * page];
        arena.read_at(0, &mut back).unwrap();
        assert_eq!(back, copy[HEADER_LEN..]);
        assert_eq!(arena.dirty_page_count(), 0);
    });
}

#[test]
fn read_write_arena_copies_everything() {
    with_registry(|registry| {
        let page = registry.page_size();
        let size = 3 * page - 10;
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(6),
                size,
                usage: Usage::ReadWrite,
            },
            registry,
        )
        .unwrap();

        assert_eq!(arena.page_count(), 3);
        assert_eq!(arena.dirty_page_count(), 3);
        arena.write_at(size - 4, b"tail").unwrap();
        assert!(arena.write_at(size - 3, b"tail").is_err());

        let required = arena.retrieve_changes(None).unwrap();
        assert_eq!(required, HEADER_LEN + size);
        let mut buffer = vec![0; required + 7];
        assert_eq!(arena.retrieve_changes(Some(&mut buffer)).unwrap(), required);
        assert_eq!(change_buffer_len(&buffer).unwrap(), required);
        assert_eq!(&buffer[required - 4..required], b"tail");

        // Still writable afterwards.
        arena.write_at(0, b"head").unwrap();
    });
}

#[test]
fn failed_apply_writes_nothing() {
    with_registry(|registry| {
        let page = registry.page_size();
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(7),
                size: 4 * page,
                usage: Usage::ReadWrite,
            },
            registry,
        )
        .unwrap();

        let diff = diff_buffer(page, &[(1, 0xaa), (9, 0xbb)]);
        let err = arena.apply_changes(&diff).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(arena.memory().iter().all(|byte| byte.load(Ordering::Relaxed) == 0));

        let copy = ChangeHeader {
            payload_len: page as u64,
            kind: ChangeKind::Copy,
        }
        .encode();
        let mut short_copy = copy.to_vec();
        short_copy.resize(HEADER_LEN + page, 1);
        let err = arena.apply_changes(&short_copy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        arena.apply_changes(&diff_buffer(page, &[(1, 0xaa)])).unwrap();
        let mut back = [0; 1];
        arena.read_at(page, &mut back).unwrap();
        assert_eq!(back, [0xaa]);
    });
}

#[test]
fn applied_pages_are_dirty() {
    with_registry(|registry| {
        let page = registry.page_size();
        let arena = Arena::new_in(
            &ArenaDesc {
                base_address: base(8),
                size: 8 * page,
                usage: Usage::ReadWriteDiff,
            },
            registry,
        )
        .unwrap();

        arena
            .apply_changes(&diff_buffer(page, &[(6, 0x11), (2, 0x22)]))
            .unwrap();
        assert_eq!(arena.dirty_page_count(), 2);

        let changes = arena.retrieve_changes_vec().unwrap();
        let pages: Vec<_> = ChangeBuffer::parse(&changes)
            .unwrap()
            .diff_pages(page)
            .unwrap()
            .map(|(idx, bytes)| (idx, bytes[0]))
            .collect();
        assert_eq!(pages, [(2, 0x22), (6, 0x11)]);
    });
}

#[test]
fn malformed_change_buffers() {
    assert_eq!(
        change_buffer_len(&[0; HEADER_LEN - 1]).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let mut unknown = ChangeHeader {
        payload_len: 0,
        kind: ChangeKind::Copy,
    }
    .encode();
    unknown[8..12].copy_from_slice(b"NOPE");
    assert!(ChangeBuffer::parse(&unknown).is_err());
    // The length is readable regardless of the kind.
    assert_eq!(change_buffer_len(&unknown).unwrap(), HEADER_LEN);

    let truncated = ChangeHeader {
        payload_len: 100,
        kind: ChangeKind::Diff,
    }
    .encode();
    assert_eq!(change_buffer_len(&truncated).unwrap(), HEADER_LEN + 100);
    assert!(ChangeBuffer::parse(&truncated).is_err());

    let mut ragged = ChangeHeader {
        payload_len: 10,
        kind: ChangeKind::Diff,
    }
    .encode()
    .to_vec();
    ragged.resize(HEADER_LEN + 10, 0);
    let buffer = ChangeBuffer::parse(&ragged).unwrap();
    assert!(buffer.diff_pages(4096).is_err());
}

#[test]
fn header_tags() {
    let head = ChangeHeader {
        payload_len: 2 * (4 + 4096),
        kind: ChangeKind::Diff,
    }
    .encode();
    assert_eq!(&head[..8], &8200u64.to_le_bytes());
    assert_eq!(u32::from_le_bytes([head[8], head[9], head[10], head[11]]), 0x4449_4646);
    assert_eq!(&head[12..], &[0; 4]);
    assert_eq!(ChangeHeader::read_from(&head).unwrap().kind, ChangeKind::Diff);
}

/// Each test gets its own aligned slot, leaving a gap for the bookkeeping pages below.
fn base(slot: usize) -> usize {
    0x2000_0000_0000 + 2 * (slot + 1) * REQUIRED_ALIGNMENT
}

fn with_registry(method: impl FnOnce(&'static FaultRegistry)) {
    let registry = Box::leak(Box::new(FaultRegistry::new()));
    method(registry)
}

/// Do what the fault handler would do for each page, then write.
fn write_tracked(arena: &Arena, offset: usize, data: &[u8]) {
    let page = arena.page_size();
    let first = offset / page;
    let last = (offset + data.len() - 1) / page;
    for idx in first..=last {
        assert!(arena.registry().handle_fault(arena.base() + idx * page));
    }

    arena.write_at(offset, data).unwrap();
}

fn diff_buffer(page_size: usize, pages: &[(u32, u8)]) -> Vec<u8> {
    let mut buffer = ChangeHeader {
        payload_len: (pages.len() * (PAGE_INDEX_LEN + page_size)) as u64,
        kind: ChangeKind::Diff,
    }
    .encode()
    .to_vec();

    for &(idx, fill) in pages {
        buffer.extend_from_slice(&idx.to_le_bytes());
        buffer.resize(buffer.len() + page_size, fill);
    }

    buffer
}
