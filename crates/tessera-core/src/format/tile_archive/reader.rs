use std::collections::HashMap;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::types::TileCoord;
use crate::{Result, TesseraError};

use super::{ArchiveEntry, PREAMBLE_SIZE, Preamble, RECORD_HEADER_SIZE, RecordHeader};

/// What a forward scan found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub entries: Vec<ArchiveEntry>,
    /// The sentinel record was reached.
    pub finalized: bool,
    /// Length of the well-formed prefix: up to and including the sentinel
    /// when finalized, otherwise up to the end of the last complete record.
    pub valid_len: u64,
}

impl ScanOutcome {
    /// Scans `reader` from byte 0 without trusting any external index.
    ///
    /// A partial trailing record is not an error; it simply ends the scan
    /// with `finalized == false`. A corrupt preamble or record header is.
    pub fn scan<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let total_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        if total_len < PREAMBLE_SIZE as u64 {
            return Ok(Self::default());
        }
        Preamble::read(reader)?;

        let mut outcome = Self {
            valid_len: PREAMBLE_SIZE as u64,
            ..Self::default()
        };
        let mut offset = PREAMBLE_SIZE as u64;

        loop {
            if offset + RECORD_HEADER_SIZE as u64 > total_len {
                break;
            }
            let header = match RecordHeader::read(reader) {
                Ok(header) => header,
                Err(TesseraError::Io(error)) if error.kind() == ErrorKind::UnexpectedEof => break,
                Err(error) => return Err(error),
            };
            let payload_offset = offset + RECORD_HEADER_SIZE as u64;

            if header.is_sentinel() {
                outcome.finalized = true;
                outcome.valid_len = payload_offset;
                break;
            }

            let end = payload_offset
                .checked_add(u64::from(header.length))
                .ok_or(TesseraError::InvalidFormat("archive offsets overflow"))?;
            if end > total_len {
                break;
            }

            outcome.entries.push(ArchiveEntry {
                coord: header.coord(),
                offset: payload_offset,
                length: header.length,
            });
            outcome.valid_len = end;
            offset = end;
            reader.seek(SeekFrom::Start(offset))?;
        }

        Ok(outcome)
    }
}

/// Random-access reader over a scanned archive.
#[derive(Debug)]
pub struct TileArchiveReader<R: Read + Seek> {
    reader: R,
    outcome: ScanOutcome,
    index: HashMap<TileCoord, usize>,
}

impl<R: Read + Seek> TileArchiveReader<R> {
    /// Indexes the archive, accepting one that was never finalized.
    pub fn scan(mut reader: R) -> Result<Self> {
        let outcome = ScanOutcome::scan(&mut reader)?;
        let index = outcome
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.coord, position))
            .collect();
        Ok(Self {
            reader,
            outcome,
            index,
        })
    }

    /// Indexes the archive and rejects it unless the sentinel is present.
    pub fn open_finalized(reader: R) -> Result<Self> {
        let archive = Self::scan(reader)?;
        if !archive.outcome.finalized {
            return Err(TesseraError::ArchiveTruncated {
                offset: archive.outcome.valid_len,
            });
        }
        Ok(archive)
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.finalized
    }

    pub fn valid_len(&self) -> u64 {
        self.outcome.valid_len
    }

    /// Entries in the order they were written.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.outcome.entries
    }

    pub fn entry(&self, coord: &TileCoord) -> Option<&ArchiveEntry> {
        self.index
            .get(coord)
            .and_then(|position| self.outcome.entries.get(*position))
    }

    pub fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let mut data = vec![0u8; entry.length as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Returns `None` when the archive holds no record for `coord`.
    pub fn read_tile(&mut self, coord: &TileCoord) -> Result<Option<Vec<u8>>> {
        match self.entry(coord).copied() {
            Some(entry) => self.read_entry(&entry).map(Some),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
