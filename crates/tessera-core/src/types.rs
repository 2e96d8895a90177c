use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, TesseraError};
use crate::source::TileSource;

pub type Result<T> = std::result::Result<T, TesseraError>;

/// Highest zoom level any map source may expose.
pub const MAX_ZOOM: u32 = 30;

/// One raster tile of a map in the slippy-map tile scheme.
///
/// Ordering is zoom first, then row, then column, which matches the order
/// the producer enumerates a map in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(zoom: u32, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Row index counted from the south edge, as used by TMS servers.
    pub fn tms_y(&self) -> u32 {
        let rows = 1u64 << self.zoom.min(MAX_ZOOM);
        (rows - 1).saturating_sub(u64::from(self.y)) as u32
    }

    /// Bing-style quadkey for this tile.
    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.zoom as usize);
        for level in (1..=self.zoom).rev() {
            let mask = 1u32 << (level - 1);
            let mut digit = b'0';
            if self.x & mask != 0 {
                digit += 1;
            }
            if self.y & mask != 0 {
                digit += 2;
            }
            key.push(digit as char);
        }
        key
    }
}

impl Ord for TileCoord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.zoom, self.y, self.x).cmp(&(other.zoom, other.y, other.x))
    }
}

impl PartialOrd for TileCoord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Inclusive rectangle of tiles at a single zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub zoom: u32,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn new(zoom: u32, min_x: u32, max_x: u32, min_y: u32, max_y: u32) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(TesseraError::Config(format!(
                "zoom {zoom} exceeds maximum {MAX_ZOOM}"
            )));
        }
        if min_x > max_x || min_y > max_y {
            return Err(TesseraError::Config(format!(
                "empty tile range x={min_x}..={max_x} y={min_y}..={max_y}"
            )));
        }
        let limit = (1u64 << zoom) - 1;
        if u64::from(max_x) > limit || u64::from(max_y) > limit {
            return Err(TesseraError::Config(format!(
                "tile range exceeds the {} tiles per axis available at zoom {zoom}",
                limit + 1
            )));
        }
        Ok(Self {
            zoom,
            min_x,
            max_x,
            min_y,
            max_y,
        })
    }

    pub fn width(&self) -> u64 {
        u64::from(self.max_x - self.min_x) + 1
    }

    pub fn height(&self) -> u64 {
        u64::from(self.max_y - self.min_y) + 1
    }

    pub fn tile_count(&self) -> u64 {
        self.width() * self.height()
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        coord.zoom == self.zoom
            && (self.min_x..=self.max_x).contains(&coord.x)
            && (self.min_y..=self.max_y).contains(&coord.y)
    }

    pub fn intersects(&self, other: &TileRange) -> bool {
        self.zoom == other.zoom
            && self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Row-major iterator over every tile in the range.
    pub fn iter(&self) -> TileRangeIter {
        TileRangeIter {
            range: *self,
            next: Some(TileCoord::new(self.zoom, self.min_x, self.min_y)),
        }
    }
}

pub struct TileRangeIter {
    range: TileRange,
    next: Option<TileCoord>,
}

impl Iterator for TileRangeIter {
    type Item = TileCoord;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = if current.x < self.range.max_x {
            Some(TileCoord::new(current.zoom, current.x + 1, current.y))
        } else if current.y < self.range.max_y {
            Some(TileCoord::new(current.zoom, self.range.min_x, current.y + 1))
        } else {
            None
        };
        Some(current)
    }
}

/// Where a worker looks for tile bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadMethod {
    /// Always fetch from the map source.
    #[default]
    Source,
    /// Only consult the tile cache; a miss means the tile is absent.
    Cache,
    /// Consult the tile cache first and fall back to the map source.
    Default,
}

/// One tile fetch, immutable once enqueued.
#[derive(Clone)]
pub struct DownloadJob {
    pub coord: TileCoord,
    pub source: Arc<dyn TileSource>,
    pub load_method: LoadMethod,
}

impl DownloadJob {
    pub fn new(coord: TileCoord, source: Arc<dyn TileSource>, load_method: LoadMethod) -> Self {
        Self {
            coord,
            source,
            load_method,
        }
    }

    /// Identity of the job: the coordinate plus the map source name.
    pub fn key(&self) -> (TileCoord, &str) {
        (self.coord, self.source.name())
    }
}

impl fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadJob")
            .field("coord", &self.coord)
            .field("source", &self.source.name())
            .field("load_method", &self.load_method)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum JobStatus {
    /// Tile bytes were fetched and stored.
    Success(Bytes),
    /// The source reported the tile as intentionally absent.
    Absent,
    /// Failed but will be attempted again.
    RetryableFailure(FetchError),
    /// Failed for good, either definitively or after exhausting retries.
    PermanentFailure(FetchError),
}

impl JobStatus {
    /// Success, absence and permanent failures all advance progress.
    pub fn is_completion(&self) -> bool {
        !matches!(self, Self::RetryableFailure(_))
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub coord: TileCoord,
    pub status: JobStatus,
    /// Zero-based attempt number that produced this outcome.
    pub attempt: u32,
}

#[inline]
pub fn duration_to_us(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}
