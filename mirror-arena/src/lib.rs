//! Memory arenas that know which of their pages were written.
//!
//! An [`Arena`] is placed at a caller-chosen address, aligned to [`REQUIRED_ALIGNMENT`]. Its
//! [`Usage`] decides what a snapshot contains:
//!
//! * `ReadWrite` arenas produce a full copy of their contents.
//! * `ReadWriteDiff` arenas keep all pages read-only. The first write to a page faults, the
//!   process-wide handler marks the page in a bitmap and makes it writable, and the write
//!   proceeds. A snapshot then holds only those pages and protects everything again.
//! * `ReadOnly` arenas can only receive changes.
//!
//! Snapshots are change buffers (see [`ChangeBuffer`]) that [`Arena::apply_changes`] replays into
//! another arena of the same size, in this process or elsewhere.
//!
//! ## The fault handler
//!
//! The first tracked arena of the [global registry](FaultRegistry::global) installs handlers for
//! `SIGSEGV` and `SIGBUS`. Faults outside of tracked arenas are forwarded to the previous handler.
//! In release builds the forwarding check is skipped unless the `validate-faults` feature is
//! enabled: then *every* protection fault is taken to be a first write into an arena, and an
//! unrelated one kills the process from inside the handler.
//!
//! ```no_run
//! use mirror_arena::{Arena, ArenaDesc, Usage};
//!
//! let arena = Arena::new(&ArenaDesc {
//!     base_address: 0x2000_0000_0000,
//!     size: 1 << 20,
//!     usage: Usage::ReadWriteDiff,
//! })?;
//!
//! arena.write_at(0x1234, b"Hello, world")?;
//! assert_eq!(arena.dirty_page_count(), 1);
//!
//! let changes = arena.retrieve_changes_vec()?;
//! assert_eq!(arena.dirty_page_count(), 0);
//! # Ok::<_, mirror_arena::Error>(())
//! ```
mod arena;
mod bookkeeping;
mod changes;
mod error;
mod layout;
mod registry;
#[cfg(test)]
mod tests;
mod trap;

pub use arena::{Arena, ArenaDesc, Usage};
pub use changes::{
    change_buffer_len, ChangeBuffer, ChangeHeader, ChangeKind, DiffPages, HEADER_LEN,
    PAGE_INDEX_LEN,
};
pub use error::{Error, ErrorKind};
pub use layout::{MAX_SIZE, REQUIRED_ALIGNMENT};
pub use registry::FaultRegistry;
pub use trap::install as install_fault_handler;
