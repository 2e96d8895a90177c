//! File-backed tile archive shared by the workers of one map pass.

mod index;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub use index::TileIndex;

use crate::format::{
    ArchiveEntry, PREAMBLE_SIZE, RECORD_HEADER_SIZE, ScanOutcome, TileArchiveReader,
    TileArchiveWriter,
};
use crate::telemetry::{self, tags};
use crate::types::TileCoord;
use crate::{Result, TesseraError};

/// Destination for tile bytes produced by workers.
pub trait TileSink: Send + Sync {
    fn store(&self, coord: TileCoord, data: &[u8]) -> Result<()>;

    /// Whether the tile is already stored, so the producer can skip it.
    fn contains(&self, _coord: &TileCoord) -> bool {
        false
    }
}

#[derive(Debug)]
struct ArchiveState {
    writer: Option<TileArchiveWriter<BufWriter<File>>>,
    reader: Option<BufReader<File>>,
    index: TileIndex,
    finalized: bool,
    deleted: bool,
}

/// Append-only tile container plus its in-memory index.
///
/// Appends from many threads are serialized on one lock that guards the
/// write cursor. Reads are served from a separate read-only handle.
#[derive(Debug)]
pub struct IndexedTileArchive {
    path: PathBuf,
    state: Mutex<ArchiveState>,
}

impl IndexedTileArchive {
    /// Creates (or truncates) the file at `path` and writes the preamble.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|error| {
            TesseraError::Io(error).with_context(format!("create archive {}", path.display()))
        })?;
        let writer = TileArchiveWriter::new(BufWriter::new(file))?;

        tracing::debug!(target: tags::TARGET_ARCHIVE, path = %path.display(), "archive created");
        Ok(Self::with_state(path, Some(writer), TileIndex::new(), false))
    }

    /// Reopens an existing archive for appending.
    ///
    /// The file is scanned from the start, any partial trailing record and
    /// any sentinel are cut off, and the index is rebuilt from what remains.
    pub fn recover(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|error| {
                TesseraError::Io(error).with_context(format!("open archive {}", path.display()))
            })?;

        let outcome = ScanOutcome::scan(&mut file)?;
        let writer = if outcome.valid_len < PREAMBLE_SIZE as u64 {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            TileArchiveWriter::new(BufWriter::new(file))?
        } else {
            let keep = if outcome.finalized {
                outcome.valid_len - RECORD_HEADER_SIZE as u64
            } else {
                outcome.valid_len
            };
            file.set_len(keep)?;
            file.seek(SeekFrom::Start(keep))?;
            TileArchiveWriter::resume(BufWriter::new(file), keep, outcome.entries.len() as u64)
        };

        telemetry::increment_counter(
            tags::METRIC_ARCHIVE_RECOVERED_RECORDS,
            outcome.entries.len() as u64,
            &[("subsystem", "archive"), ("op", "recover")],
        );
        tracing::info!(
            target: tags::TARGET_ARCHIVE,
            path = %path.display(),
            records = outcome.entries.len(),
            was_finalized = outcome.finalized,
            "archive recovered"
        );

        let index = TileIndex::from_entries(outcome.entries);
        Ok(Self::with_state(path, Some(writer), index, false))
    }

    /// Opens a finalized archive read-only.
    pub fn open_finalized(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|error| {
            TesseraError::Io(error).with_context(format!("open archive {}", path.display()))
        })?;
        let reader = TileArchiveReader::open_finalized(BufReader::new(file))?;
        let index = TileIndex::from_entries(reader.entries().to_vec());

        let archive = Self::with_state(path, None, index, true);
        archive.lock().reader = Some(reader.into_inner());
        Ok(archive)
    }

    fn with_state(
        path: PathBuf,
        writer: Option<TileArchiveWriter<BufWriter<File>>>,
        index: TileIndex,
        finalized: bool,
    ) -> Self {
        Self {
            path,
            state: Mutex::new(ArchiveState {
                writer,
                reader: None,
                index,
                finalized,
                deleted: false,
            }),
        }
    }

    pub fn append(&self, coord: TileCoord, data: &[u8]) -> Result<ArchiveEntry> {
        let mut state = self.lock();
        let writer = state.writer.as_mut().ok_or(TesseraError::ArchiveClosed)?;
        let entry = writer.append(coord, data)?;
        state.index.insert(entry);
        Ok(entry)
    }

    /// Writes the sentinel and syncs the file. Further appends fail.
    ///
    /// Calling it again on a finalized archive is a no-op.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.lock();
        if state.finalized {
            return Ok(());
        }
        let writer = state.writer.take().ok_or(TesseraError::ArchiveClosed)?;
        let records = writer.records_written();
        let file = writer
            .finish()?
            .into_inner()
            .map_err(|error| TesseraError::Io(error.into_error()))?;
        file.sync_all()?;
        state.finalized = true;

        tracing::debug!(
            target: tags::TARGET_ARCHIVE,
            path = %self.path.display(),
            records,
            "archive finalized"
        );
        Ok(())
    }

    /// Snapshot of all entries in write order.
    pub fn entries(&self) -> Vec<ArchiveEntry> {
        self.lock().index.entries().to_vec()
    }

    pub fn entry_count(&self) -> usize {
        self.lock().index.len()
    }

    pub fn entry(&self, coord: &TileCoord) -> Option<ArchiveEntry> {
        self.lock().index.get(coord).copied()
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.lock().index.contains(coord)
    }

    pub fn read_tile(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if state.deleted {
            return Err(TesseraError::ArchiveClosed);
        }
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        if state.reader.is_none() {
            state.reader = Some(BufReader::new(File::open(&self.path)?));
        }
        let Some(reader) = state.reader.as_mut() else {
            return Err(TesseraError::ArchiveClosed);
        };
        read_exact_at(reader, entry)
    }

    /// Reads the newest record for `coord`, if any.
    pub fn read_coord(&self, coord: &TileCoord) -> Result<Option<Vec<u8>>> {
        match self.entry(coord) {
            Some(entry) => self.read_tile(&entry).map(Some),
            None => Ok(None),
        }
    }

    /// Drops the write handle without a sentinel and deletes the file.
    pub fn abort(&self) -> Result<()> {
        tracing::debug!(target: tags::TARGET_ARCHIVE, path = %self.path.display(), "archive aborted");
        self.delete_underlying()
    }

    /// Closes every handle and removes the file. Safe to call repeatedly.
    pub fn delete_underlying(&self) -> Result<()> {
        let mut state = self.lock();
        state.writer = None;
        state.reader = None;
        state.deleted = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(TesseraError::Io(error)
                .with_context(format!("delete archive {}", self.path.display()))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TileSink for IndexedTileArchive {
    fn store(&self, coord: TileCoord, data: &[u8]) -> Result<()> {
        self.append(coord, data).map(|_| ())
    }

    fn contains(&self, coord: &TileCoord) -> bool {
        IndexedTileArchive::contains(self, coord)
    }
}

fn read_exact_at(reader: &mut BufReader<File>, entry: &ArchiveEntry) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(entry.offset))?;
    let mut data = vec![0u8; entry.length as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}
