//! Virtual memory at fixed addresses.
//!
//! All interaction with the operating system goes through a [`VTable`] of plain functions, owned
//! by a cheaply clonable [`Mapper`]. The default table links against `libc`; a test can swap any
//! entry for a double, e.g. an `mmap` that always fails, without hooking the real symbols.
//!
//! Mappings are always anonymous and private. A [`Region`] is placed *exactly* at the requested
//! address or not at all, and is released when dropped.
#![cfg_attr(not(test), no_std)]
mod mmap;
mod region;

extern crate alloc;

pub use mmap::{Mapper, Protection, VTable, VmError};
pub use region::Region;
