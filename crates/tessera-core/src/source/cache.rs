use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::archive::TileSink;
use crate::telemetry::tags;
use crate::types::TileCoord;
use crate::{Result, TesseraError};

/// Long-lived keyed tile store consulted before hitting a source.
///
/// The pipeline never writes back on its own; only a run whose sink is a
/// [`CacheSink`] stores into the cache.
pub trait TileCache: Send + Sync {
    fn get(&self, coord: TileCoord, source: &str) -> Option<Bytes>;

    fn put(&self, coord: TileCoord, source: &str, data: &[u8]) -> Result<()>;

    fn contains(&self, coord: TileCoord, source: &str) -> bool {
        self.get(coord, source).is_some()
    }

    /// Releases underlying resources. Called once at shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTileCache {
    tiles: RwLock<HashMap<(String, TileCoord), Bytes>>,
}

impl MemoryTileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        match self.tiles.read() {
            Ok(tiles) => tiles.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TileCache for MemoryTileCache {
    fn get(&self, coord: TileCoord, source: &str) -> Option<Bytes> {
        let tiles = match self.tiles.read() {
            Ok(tiles) => tiles,
            Err(poisoned) => poisoned.into_inner(),
        };
        tiles.get(&(source.to_owned(), coord)).cloned()
    }

    fn put(&self, coord: TileCoord, source: &str, data: &[u8]) -> Result<()> {
        let mut tiles = match self.tiles.write() {
            Ok(tiles) => tiles,
            Err(poisoned) => poisoned.into_inner(),
        };
        tiles.insert((source.to_owned(), coord), Bytes::copy_from_slice(data));
        Ok(())
    }
}

/// Cache stored as `root/{source}/{z}/{x}/{y}.tile`.
#[derive(Debug, Clone)]
pub struct DirectoryTileCache {
    root: PathBuf,
}

impl DirectoryTileCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            TesseraError::Io(error).with_context(format!("open tile cache {}", root.display()))
        })?;
        tracing::debug!(target: tags::TARGET_SOURCE, root = %root.display(), "tile cache opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tile_path(&self, coord: TileCoord, source: &str) -> PathBuf {
        self.root
            .join(sanitize(source))
            .join(coord.zoom.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.tile", coord.y))
    }
}

impl TileCache for DirectoryTileCache {
    fn get(&self, coord: TileCoord, source: &str) -> Option<Bytes> {
        match fs::read(self.tile_path(coord, source)) {
            Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
            Ok(_) => None,
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(target: tags::TARGET_SOURCE, tile = %coord, source, %error, "tile cache read failed");
                None
            }
        }
    }

    fn put(&self, coord: TileCoord, source: &str, data: &[u8]) -> Result<()> {
        let path = self.tile_path(coord, source);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = path.with_extension("tile.part");
        fs::write(&partial, data)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }

    fn contains(&self, coord: TileCoord, source: &str) -> bool {
        self.tile_path(coord, source).is_file()
    }
}

fn sanitize(source: &str) -> String {
    source
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Routes worker output into a [`TileCache`] instead of an archive.
pub struct CacheSink {
    cache: Arc<dyn TileCache>,
    source: String,
}

impl CacheSink {
    pub fn new(cache: Arc<dyn TileCache>, source: impl Into<String>) -> Self {
        Self {
            cache,
            source: source.into(),
        }
    }
}

impl TileSink for CacheSink {
    fn store(&self, coord: TileCoord, data: &[u8]) -> Result<()> {
        self.cache.put(coord, &self.source, data)
    }

    fn contains(&self, coord: &TileCoord) -> bool {
        self.cache.contains(*coord, &self.source)
    }
}
