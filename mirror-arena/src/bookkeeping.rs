//! The dirty page bitmap of a tracked arena.
//!
//! Shared between the fault handler, which only ever sets bits, and snapshots, which read and
//! clear all of them while holding the registry exclusively.
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::layout::Layout;

#[repr(C)]
pub(crate) struct Header {
    magic: AtomicU32,
    page_count: AtomicU32,
    /// The number of set bits in the bitmap.
    dirty: AtomicU64,
}

impl Header {
    pub(crate) const LEN: usize = core::mem::size_of::<Header>();
    const MAGIC: u32 = u32::from_be_bytes(*b"MIRR");
}

/// Resolved pointers into a bookkeeping region.
///
/// The lifetime is whatever the caller promised in [`Bookkeeping::from_addr`], usually the
/// `Arena` owning the mapping.
pub(crate) struct Bookkeeping<'lt> {
    header: &'lt Header,
    bits: &'lt [AtomicU64],
}

impl<'lt> Bookkeeping<'lt> {
    /// Safety:
    ///
    /// Caller promises that `addr` points to a readable and writable mapping of
    /// `layout.bookkeeping_len()` bytes, valid for `'lt`. The contents need not be initialized
    /// bookkeeping, all pages of a mapping are at least zeroed memory.
    pub(crate) unsafe fn from_addr(addr: usize, layout: Layout) -> Self {
        let header = &*(addr as *const Header);
        let bits = core::slice::from_raw_parts(
            (addr + Header::LEN) as *const AtomicU64,
            layout.bitmap_words(),
        );

        Bookkeeping { header, bits }
    }

    pub(crate) fn initialize(&self, page_count: usize) {
        debug_assert!(page_count <= self.bits.len() * 64);
        for word in self.bits {
            word.store(0, Ordering::Relaxed);
        }

        self.header.dirty.store(0, Ordering::Relaxed);
        self.header
            .page_count
            .store(page_count as u32, Ordering::Relaxed);
        self.header.magic.store(Header::MAGIC, Ordering::Release);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.header.magic.load(Ordering::Acquire) == Header::MAGIC
    }

    pub(crate) fn page_count(&self) -> usize {
        self.header.page_count.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn dirty_pages(&self) -> usize {
        self.header.dirty.load(Ordering::Acquire) as usize
    }

    /// Set the bit of a page, returning whether it was clear before.
    pub(crate) fn mark(&self, page: usize) -> bool {
        let Some(word) = self.bits.get(page / 64) else {
            return false;
        };

        let bit = 1u64 << (page % 64);
        if word.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            self.header.dirty.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&self) {
        for word in self.bits {
            word.store(0, Ordering::Relaxed);
        }

        self.header.dirty.store(0, Ordering::Release);
    }

    /// All marked pages, ascending.
    pub(crate) fn dirty(&self) -> impl Iterator<Item = usize> + 'lt {
        let limit = self.page_count();
        let bits: &'lt [AtomicU64] = self.bits;
        bits.iter()
            .enumerate()
            .flat_map(|(idx, word)| SetBits {
                word: word.load(Ordering::Acquire),
                base: idx * 64,
            })
            .take_while(move |&page| page < limit)
    }
}

struct SetBits {
    word: u64,
    base: usize,
}

impl Iterator for SetBits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.word == 0 {
            return None;
        }

        let bit = self.word.trailing_zeros() as usize;
        self.word &= self.word - 1;
        Some(self.base + bit)
    }
}
