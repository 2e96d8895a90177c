use std::io::Write;
use std::time::Instant;

use crate::telemetry::{self, tags};
use crate::types::{TileCoord, duration_to_us};
use crate::{Result, TesseraError};

use super::{ArchiveEntry, MAX_RECORD_LEN, PREAMBLE_SIZE, Preamble, RECORD_HEADER_SIZE, RecordHeader};

/// Streams tile records into an archive.
///
/// The writer tracks its own byte position so every returned
/// [`ArchiveEntry`] carries an absolute offset without seeking.
#[derive(Debug)]
pub struct TileArchiveWriter<W: Write> {
    writer: W,
    position: u64,
    records_written: u64,
}

impl<W: Write> TileArchiveWriter<W> {
    /// Starts a fresh archive by writing the preamble.
    pub fn new(mut writer: W) -> Result<Self> {
        Preamble::default().write(&mut writer)?;
        Ok(Self {
            writer,
            position: PREAMBLE_SIZE as u64,
            records_written: 0,
        })
    }

    /// Continues an archive whose valid prefix ends at `position`.
    ///
    /// `writer` must already be positioned there.
    pub fn resume(writer: W, position: u64, records_written: u64) -> Self {
        Self {
            writer,
            position,
            records_written,
        }
    }

    pub fn append(&mut self, coord: TileCoord, data: &[u8]) -> Result<ArchiveEntry> {
        let started = Instant::now();
        if data.is_empty() {
            return Err(TesseraError::InvalidFormat(
                "empty tile payload collides with the end-of-archive sentinel",
            ));
        }
        if data.len() > MAX_RECORD_LEN {
            return Err(TesseraError::InvalidFormat("tile payload exceeds u32 length"));
        }

        let header = RecordHeader::new(coord, data.len() as u32);
        header.validate()?;
        header.write(&mut self.writer)?;
        self.writer.write_all(data)?;

        let entry = ArchiveEntry {
            coord,
            offset: self.position + RECORD_HEADER_SIZE as u64,
            length: header.length,
        };
        self.position = entry.end();
        self.records_written += 1;

        let labels = [("subsystem", "archive"), ("op", "append")];
        telemetry::increment_counter(tags::METRIC_ARCHIVE_APPEND_COUNT, 1, &labels);
        telemetry::increment_counter(tags::METRIC_ARCHIVE_APPEND_BYTES, data.len() as u64, &labels);
        telemetry::record_histogram(
            tags::METRIC_ARCHIVE_APPEND_LATENCY_US,
            duration_to_us(started.elapsed()),
            &labels,
        );

        Ok(entry)
    }

    /// Writes the sentinel record, flushes, and hands back the sink.
    pub fn finish(mut self) -> Result<W> {
        RecordHeader::sentinel().write(&mut self.writer)?;
        self.writer.flush()?;
        telemetry::increment_counter(
            tags::METRIC_ARCHIVE_FINALIZE_COUNT,
            1,
            &[("subsystem", "archive"), ("op", "finalize")],
        );
        Ok(self.writer)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Byte position where the next record header will start.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
