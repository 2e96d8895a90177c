use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::FetchError;
use crate::telemetry::tags;
use crate::types::{MAX_ZOOM, TileCoord};
use crate::{Result, TesseraError};

use super::{FetchContext, SourceKind, TileSource};

/// Directory layout of a local tile tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileLayout {
    /// `z/x/y.ext`
    #[default]
    Osm,
    /// `z/x/y.ext.tile`
    OsmAnd,
    /// `z/x/y.ext` with the row counted from the south edge.
    Tms,
}

/// Tiles read straight from the local file system.
///
/// These never go through the download queue; a missing file is a
/// permanent miss.
#[derive(Debug, Clone)]
pub struct FileTileSource {
    name: String,
    root: PathBuf,
    layout: FileLayout,
    extension: String,
    min_zoom: u32,
    max_zoom: u32,
}

impl FileTileSource {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        layout: FileLayout,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            layout,
            extension: extension.into().trim_start_matches('.').to_owned(),
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
        }
    }

    /// Opens `root` and narrows the zoom range to the numeric
    /// subdirectories present.
    pub fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        layout: FileLayout,
        extension: impl Into<String>,
    ) -> Result<Self> {
        let mut source = Self::new(name, root, layout, extension);
        let mut zooms = Vec::new();
        let entries = fs::read_dir(&source.root).map_err(|error| {
            TesseraError::Io(error)
                .with_context(format!("open tile directory {}", source.root.display()))
        })?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(zoom) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
                .filter(|zoom| *zoom <= MAX_ZOOM)
            {
                zooms.push(zoom);
            }
        }

        match (zooms.iter().min(), zooms.iter().max()) {
            (Some(min), Some(max)) => {
                source.min_zoom = *min;
                source.max_zoom = *max;
            }
            _ => {
                tracing::warn!(
                    target: tags::TARGET_SOURCE,
                    root = %source.root.display(),
                    "tile directory has no zoom levels"
                );
            }
        }
        Ok(source)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> FileLayout {
        self.layout
    }

    pub fn tile_path(&self, coord: TileCoord) -> PathBuf {
        let row = match self.layout {
            FileLayout::Tms => coord.tms_y(),
            FileLayout::Osm | FileLayout::OsmAnd => coord.y,
        };
        let file_name = match self.layout {
            FileLayout::OsmAnd => format!("{row}.{}.tile", self.extension),
            FileLayout::Osm | FileLayout::Tms => format!("{row}.{}", self.extension),
        };
        self.root
            .join(coord.zoom.to_string())
            .join(coord.x.to_string())
            .join(file_name)
    }
}

impl TileSource for FileTileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FileBased
    }

    fn initialize(&self) -> std::result::Result<(), FetchError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(FetchError::Misconfigured(format!(
                "tile directory {} is not available",
                self.root.display()
            )))
        }
    }

    fn min_zoom(&self) -> u32 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u32 {
        self.max_zoom
    }

    fn tile_location(&self, coord: TileCoord) -> Option<String> {
        Some(self.tile_path(coord).display().to_string())
    }

    fn fetch(&self, coord: TileCoord, ctx: &FetchContext<'_>) -> std::result::Result<Option<Bytes>, FetchError> {
        ctx.check_cancelled()?;
        let path = self.tile_path(coord);
        match fs::read(&path) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(FetchError::NotFound(path.display().to_string()))
            }
            Err(error) => Err(FetchError::Malformed(format!(
                "reading {}: {error}",
                path.display()
            ))),
        }
    }

    fn contains(&self, coord: &TileCoord) -> bool {
        self.tile_path(*coord).is_file()
    }
}
