pub mod tile_archive;

pub use tile_archive::{
    ARCHIVE_MAGIC, ARCHIVE_VERSION, ArchiveEntry, PREAMBLE_SIZE, Preamble, RECORD_HEADER_SIZE,
    RecordHeader, ScanOutcome, TileArchiveReader, TileArchiveWriter,
};
