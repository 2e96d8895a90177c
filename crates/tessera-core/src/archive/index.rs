use std::collections::HashMap;

use crate::format::ArchiveEntry;
use crate::types::TileCoord;

/// Ordered catalogue of archive records with lookup by coordinate.
///
/// If a coordinate is written twice the lookup resolves to the newest
/// record while [`entries`](Self::entries) keeps both in write order.
#[derive(Debug, Clone, Default)]
pub struct TileIndex {
    entries: Vec<ArchiveEntry>,
    positions: HashMap<TileCoord, usize>,
}

impl TileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ArchiveEntry>) -> Self {
        let mut index = Self {
            entries: Vec::with_capacity(entries.len()),
            positions: HashMap::with_capacity(entries.len()),
        };
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    pub fn insert(&mut self, entry: ArchiveEntry) {
        self.positions.insert(entry.coord, self.entries.len());
        self.entries.push(entry);
    }

    pub fn get(&self, coord: &TileCoord) -> Option<&ArchiveEntry> {
        self.positions
            .get(coord)
            .and_then(|position| self.entries.get(*position))
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.positions.contains_key(coord)
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Number of records, counting rewrites.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
