/// Magic bytes at the start of a tile archive.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"TSRA";
/// Current version of the tile archive format.
pub const ARCHIVE_VERSION: u16 = 1;

/// Fixed size of the archive preamble in bytes.
pub const PREAMBLE_SIZE: usize = 8;
/// Fixed size of each record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Largest payload a single record can describe.
pub const MAX_RECORD_LEN: usize = u32::MAX as usize;
