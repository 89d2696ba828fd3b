//! The serialized form of a snapshot.
//!
//! ```text
//! header:  payload_len: u64, kind: u32, padding: u32      (16 bytes, little endian)
//! COPY:    the arena's bytes, payload_len == arena size
//! DIFF:    repeated { page: u32, bytes: [u8; page size] }
//! ```
//!
//! The kind is a four-character tag, `'COPY'` or `'DIFF'`, stored as the big-endian number of its
//! ASCII bytes. Anything following the declared payload is ignored, so a buffer may be handed over
//! with slack at the end.
use core::slice::ChunksExact;

use crate::{Error, ErrorKind};

/// Length of the header in front of every change buffer.
pub const HEADER_LEN: usize = 16;

/// Length of the page number in front of every page of a diff.
pub const PAGE_INDEX_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The full contents.
    Copy,
    /// Only the pages written since the last snapshot.
    Diff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChangeHeader {
    pub payload_len: u64,
    pub kind: ChangeKind,
}

/// A change buffer with a validated header.
#[derive(Clone, Copy, Debug)]
pub struct ChangeBuffer<'lt> {
    header: ChangeHeader,
    payload: &'lt [u8],
}

/// The pages of a diff, in buffer order.
#[derive(Clone, Debug)]
pub struct DiffPages<'lt> {
    records: ChunksExact<'lt, u8>,
}

/// The length of the change buffer starting at `buffer`, header included.
///
/// Only looks at the header. The payload does not need to be present.
pub fn change_buffer_len(buffer: &[u8]) -> Result<usize, Error> {
    let head = header_bytes(buffer)?;
    let mut payload_len = [0; 8];
    payload_len.copy_from_slice(&head[..8]);

    usize::try_from(u64::from_le_bytes(payload_len))
        .ok()
        .and_then(|len| len.checked_add(HEADER_LEN))
        .ok_or(Error::new(ErrorKind::InvalidArgument, "change buffer length overflows"))
}

impl ChangeKind {
    pub const COPY_TAG: u32 = u32::from_be_bytes(*b"COPY");
    pub const DIFF_TAG: u32 = u32::from_be_bytes(*b"DIFF");

    pub fn tag(self) -> u32 {
        match self {
            ChangeKind::Copy => Self::COPY_TAG,
            ChangeKind::Diff => Self::DIFF_TAG,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            Self::COPY_TAG => Some(ChangeKind::Copy),
            Self::DIFF_TAG => Some(ChangeKind::Diff),
            _ => None,
        }
    }
}

impl ChangeHeader {
    pub fn read_from(buffer: &[u8]) -> Result<Self, Error> {
        let head = header_bytes(buffer)?;
        let mut payload_len = [0; 8];
        payload_len.copy_from_slice(&head[..8]);
        let mut tag = [0; 4];
        tag.copy_from_slice(&head[8..12]);

        let Some(kind) = ChangeKind::from_tag(u32::from_le_bytes(tag)) else {
            return Err(Error::new(ErrorKind::InvalidArgument, "unknown change buffer kind"));
        };

        Ok(ChangeHeader {
            payload_len: u64::from_le_bytes(payload_len),
            kind,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut head = [0; HEADER_LEN];
        head[..8].copy_from_slice(&self.payload_len.to_le_bytes());
        head[8..12].copy_from_slice(&self.kind.tag().to_le_bytes());
        head
    }
}

impl<'lt> ChangeBuffer<'lt> {
    pub fn parse(buffer: &'lt [u8]) -> Result<Self, Error> {
        let header = ChangeHeader::read_from(buffer)?;
        let len = change_buffer_len(buffer)?;
        let Some(payload) = buffer.get(HEADER_LEN..len) else {
            return Err(Error::new(ErrorKind::InvalidArgument, "change buffer is truncated"));
        };

        Ok(ChangeBuffer { header, payload })
    }

    pub fn header(&self) -> ChangeHeader {
        self.header
    }

    pub fn kind(&self) -> ChangeKind {
        self.header.kind
    }

    pub fn payload(&self) -> &'lt [u8] {
        self.payload
    }

    /// Split a diff payload into its pages.
    pub fn diff_pages(&self, page_size: usize) -> Result<DiffPages<'lt>, Error> {
        if self.header.kind != ChangeKind::Diff {
            return Err(Error::new(ErrorKind::InvalidArgument, "change buffer is not a page diff"));
        }

        let record = PAGE_INDEX_LEN + page_size;
        if self.payload.len() % record != 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "page diff does not consist of whole pages",
            ));
        }

        Ok(DiffPages {
            records: self.payload.chunks_exact(record),
        })
    }
}

impl<'lt> Iterator for DiffPages<'lt> {
    type Item = (u32, &'lt [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let (index, bytes) = record.split_at(PAGE_INDEX_LEN);
        let mut page = [0; PAGE_INDEX_LEN];
        page.copy_from_slice(index);
        Some((u32::from_le_bytes(page), bytes))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

impl ExactSizeIterator for DiffPages<'_> {}

impl core::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ChangeKind::Copy => "COPY",
            ChangeKind::Diff => "DIFF",
        })
    }
}

fn header_bytes(buffer: &[u8]) -> Result<&[u8], Error> {
    buffer
        .get(..HEADER_LEN)
        .ok_or(Error::new(ErrorKind::InvalidArgument, "change buffer shorter than its header"))
}
