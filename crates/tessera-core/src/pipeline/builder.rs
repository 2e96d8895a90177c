use std::sync::atomic::AtomicBool;

use bytes::Bytes;

use crate::archive::IndexedTileArchive;
use crate::error::FetchError;
use crate::source::{FetchContext, NoopSourceListener, TileSource};
use crate::types::{Result, TileCoord};

use super::{LayerSpec, MapSpec};

/// Random access to the tiles of one map during assembly.
pub trait TileProvider {
    /// `Ok(None)` when the map has no tile at `coord`.
    fn tile(&self, coord: TileCoord) -> Result<Option<Bytes>>;
}

/// Serves tiles from a finalized download archive.
pub struct ArchiveTileProvider<'a> {
    archive: &'a IndexedTileArchive,
}

impl<'a> ArchiveTileProvider<'a> {
    pub fn new(archive: &'a IndexedTileArchive) -> Self {
        Self { archive }
    }
}

impl TileProvider for ArchiveTileProvider<'_> {
    fn tile(&self, coord: TileCoord) -> Result<Option<Bytes>> {
        Ok(self.archive.read_coord(&coord)?.map(Bytes::from))
    }
}

/// Reads file-based sources directly, bypassing the download queue.
pub struct SourceTileProvider<'a> {
    source: &'a dyn TileSource,
    cancelled: AtomicBool,
}

impl<'a> SourceTileProvider<'a> {
    pub fn new(source: &'a dyn TileSource) -> Self {
        Self {
            source,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl TileProvider for SourceTileProvider<'_> {
    fn tile(&self, coord: TileCoord) -> Result<Option<Bytes>> {
        let listener = NoopSourceListener;
        let ctx = FetchContext::new(&listener, &self.cancelled);
        match self.source.fetch(coord, &ctx) {
            Ok(data) => Ok(data),
            Err(FetchError::NotFound(_)) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

/// Turns downloaded maps into the final atlas format.
///
/// Calls arrive in order: `begin_layer`, then `build_map` for each map of
/// the layer, then `finish_layer`. `abort` replaces the remaining calls
/// when the run is cancelled.
pub trait MapBuilder: Send {
    fn supports_source(&self, _source: &dyn TileSource) -> bool {
        true
    }

    fn begin_layer(&mut self, _layer: &LayerSpec) -> Result<()> {
        Ok(())
    }

    fn build_map(&mut self, map: &MapSpec, tiles: &dyn TileProvider) -> Result<()>;

    fn finish_layer(&mut self, _layer: &LayerSpec) -> Result<()> {
        Ok(())
    }

    fn finish_atlas(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}
