//! Append-only tile archive format.
//!
//! An archive is an 8-byte preamble followed by records of
//! `[zoom:u32][x:u32][y:u32][length:u32][payload]`, all little endian,
//! terminated by a zero-length sentinel record. The index can always be
//! rebuilt with one forward scan; an archive without the sentinel was never
//! finalized and must be discarded or recovered.

mod consts;
mod headers;
mod reader;
mod writer;

pub use consts::{
    ARCHIVE_MAGIC, ARCHIVE_VERSION, MAX_RECORD_LEN, PREAMBLE_SIZE, RECORD_HEADER_SIZE,
};
pub use headers::{ArchiveEntry, Preamble, RecordHeader};
pub use reader::{ScanOutcome, TileArchiveReader};
pub use writer::TileArchiveWriter;
