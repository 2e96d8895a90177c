use std::fmt;
use std::sync::Arc;

use crate::source::TileSource;
use crate::types::{LoadMethod, TileCoord, TileRange};

/// One map of an atlas: a source plus the tile ranges to take from it.
#[derive(Clone)]
pub struct MapSpec {
    pub name: String,
    pub source: Arc<dyn TileSource>,
    pub ranges: Vec<TileRange>,
    pub load_method: LoadMethod,
}

impl MapSpec {
    pub fn new(name: impl Into<String>, source: Arc<dyn TileSource>, ranges: Vec<TileRange>) -> Self {
        Self {
            name: name.into(),
            source,
            ranges,
            load_method: LoadMethod::default(),
        }
    }

    pub fn with_load_method(mut self, load_method: LoadMethod) -> Self {
        self.load_method = load_method;
        self
    }

    /// Number of distinct tiles; a tile covered by several ranges counts once.
    pub fn tile_count(&self) -> u64 {
        self.ranges
            .iter()
            .enumerate()
            .map(|(index, range)| {
                if self.ranges[..index].iter().any(|earlier| earlier.intersects(range)) {
                    range
                        .iter()
                        .filter(|coord| !self.covered_before(index, coord))
                        .count() as u64
                } else {
                    range.tile_count()
                }
            })
            .sum()
    }

    /// Every coordinate of the map exactly once, range by range, row-major.
    ///
    /// Tiles already yielded by an earlier overlapping range are skipped.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        self.ranges.iter().enumerate().flat_map(move |(index, range)| {
            range
                .iter()
                .filter(move |coord| !self.covered_before(index, coord))
        })
    }

    fn covered_before(&self, index: usize, coord: &TileCoord) -> bool {
        self.ranges[..index].iter().any(|range| range.contains(coord))
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.ranges.iter().any(|range| range.contains(coord))
    }

    pub fn is_file_based(&self) -> bool {
        self.source.is_file_based()
    }
}

impl fmt::Debug for MapSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapSpec")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("ranges", &self.ranges)
            .field("load_method", &self.load_method)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub name: String,
    pub maps: Vec<MapSpec>,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, maps: Vec<MapSpec>) -> Self {
        Self {
            name: name.into(),
            maps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AtlasSpec {
    pub name: String,
    pub layers: Vec<LayerSpec>,
}

impl AtlasSpec {
    pub fn new(name: impl Into<String>, layers: Vec<LayerSpec>) -> Self {
        Self {
            name: name.into(),
            layers,
        }
    }

    pub fn maps(&self) -> impl Iterator<Item = &MapSpec> {
        self.layers.iter().flat_map(|layer| layer.maps.iter())
    }

    pub fn map_count(&self) -> usize {
        self.maps().count()
    }

    pub fn tile_count(&self) -> u64 {
        self.maps().map(MapSpec::tile_count).sum()
    }

    /// Tiles that have to be downloaded; file-based maps are read in place.
    pub fn online_tile_count(&self) -> u64 {
        self.maps()
            .filter(|map| !map.is_file_based())
            .map(MapSpec::tile_count)
            .sum()
    }
}
