use thiserror::Error;

use crate::types::TileCoord;

/// How a failed fetch is treated by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt, bounded by the retry budget.
    Retryable,
    /// Definitive miss; counts as a completed job with a gap in the archive.
    Permanent,
    /// Escapes the worker and aborts the map.
    Fatal,
}

/// Per-tile fetch failures reported by map sources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("tile not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("map source misconfigured: {0}")]
    Misconfigured(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) => FailureClass::Retryable,
            Self::NotFound(_) | Self::Malformed(_) | Self::Cancelled => FailureClass::Permanent,
            Self::Misconfigured(_) => FailureClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("archive truncated at byte offset {offset}; it was never finalized")]
    ArchiveTruncated { offset: u64 },
    #[error("archive is closed for writing")]
    ArchiveClosed,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("map \"{map}\" uses source \"{source_name}\" which the map builder does not support")]
    UnsupportedSource { map: String, source_name: String },
    #[error("atlas requires {requested} online tiles, limit is {limit}")]
    TooManyTiles { requested: u64, limit: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("fatal error while processing tile {coord}: {source}")]
    Fatal {
        coord: TileCoord,
        #[source]
        source: Box<TesseraError>,
    },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TesseraError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TesseraError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns true when the error, or any error it wraps, is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled | Self::Fetch(FetchError::Cancelled) => true,
            Self::Context { source, .. } | Self::Fatal { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}
