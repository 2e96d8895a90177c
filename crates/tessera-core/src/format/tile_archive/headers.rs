use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::types::{MAX_ZOOM, TileCoord};
use crate::{Result, TesseraError};

use super::{ARCHIVE_MAGIC, ARCHIVE_VERSION, PREAMBLE_SIZE, RECORD_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub magic: [u8; 4],
    pub version: u16,
    pub reserved: u16,
}

impl Default for Preamble {
    fn default() -> Self {
        Self {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            reserved: 0,
        }
    }
}

impl Preamble {
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; PREAMBLE_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> [u8; PREAMBLE_SIZE] {
        let mut bytes = [0u8; PREAMBLE_SIZE];
        bytes[..4].copy_from_slice(&self.magic);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: [u8; PREAMBLE_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != ARCHIVE_MAGIC {
            return Err(TesseraError::InvalidFormat("invalid tile archive magic"));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != ARCHIVE_VERSION {
            return Err(TesseraError::InvalidFormat(
                "unsupported tile archive version",
            ));
        }

        let reserved = u16::from_le_bytes([bytes[6], bytes[7]]);
        if reserved != 0 {
            return Err(TesseraError::InvalidFormat("invalid preamble reserved bits"));
        }

        Ok(Self {
            magic,
            version,
            reserved,
        })
    }
}

/// Framing in front of every tile payload.
///
/// A header with `length == 0` is the end-of-archive sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
    pub length: u32,
}

impl RecordHeader {
    pub fn new(coord: TileCoord, length: u32) -> Self {
        Self {
            zoom: coord.zoom,
            x: coord.x,
            y: coord.y,
            length,
        }
    }

    pub fn sentinel() -> Self {
        Self {
            zoom: 0,
            x: 0,
            y: 0,
            length: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.length == 0
    }

    pub fn coord(&self) -> TileCoord {
        TileCoord::new(self.zoom, self.x, self.y)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.zoom.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.x.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.y.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            zoom: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            x: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            y: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            length: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        };
        header.validate()?;
        Ok(header)
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.is_sentinel() {
            if self.zoom != 0 || self.x != 0 || self.y != 0 {
                return Err(TesseraError::InvalidFormat(
                    "sentinel record carries a coordinate",
                ));
            }
            return Ok(());
        }
        if self.zoom > MAX_ZOOM {
            return Err(TesseraError::InvalidFormat("record zoom out of range"));
        }
        let limit = 1u64 << self.zoom;
        if u64::from(self.x) >= limit || u64::from(self.y) >= limit {
            return Err(TesseraError::InvalidFormat(
                "record coordinate out of range for its zoom",
            ));
        }
        Ok(())
    }
}

/// Location of one tile payload inside an archive.
///
/// `offset` is the absolute byte position of the payload (after its record
/// header) and `length` excludes framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub coord: TileCoord,
    pub offset: u64,
    pub length: u32,
}

impl ArchiveEntry {
    /// Byte position just past this entry's payload.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}
