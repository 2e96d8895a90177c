//! Map sources and the resolver that turns a [`DownloadJob`] into bytes.

mod cache;
mod composite;
mod file;
mod http;
mod scripted;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

pub use cache::{CacheSink, DirectoryTileCache, MemoryTileCache, TileCache};
pub use composite::{CompositeLayer, CompositeSource};
pub use file::{FileLayout, FileTileSource};
pub use http::{HttpClient, HttpResponse, HttpSource, ReqwestClient, UrlTemplate};
pub use scripted::{ScriptedSource, TileRequest, TileScript};

use crate::error::FetchError;
use crate::telemetry::{self, tags};
use crate::types::{DownloadJob, LoadMethod, MAX_ZOOM, TileCoord, duration_to_us};

/// Broad family a map source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Http,
    FileBased,
    Scripted,
    Composite,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::FileBased => "file",
            Self::Scripted => "scripted",
            Self::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// A provider of tile bytes.
///
/// `fetch` returns `Ok(None)` when the source knows the tile intentionally
/// does not exist; an `Err` means the fetch itself failed.
pub trait TileSource: Send + Sync {
    /// Stable identifier, also used as the tile cache namespace.
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Called once before every download pass of a map using this source.
    ///
    /// An error fails the map before any tile is enqueued.
    fn initialize(&self) -> Result<(), FetchError> {
        Ok(())
    }

    fn min_zoom(&self) -> u32 {
        0
    }

    fn max_zoom(&self) -> u32 {
        MAX_ZOOM
    }

    /// URL or path the tile would be read from, if the source has one.
    fn tile_location(&self, coord: TileCoord) -> Option<String>;

    fn fetch(&self, coord: TileCoord, ctx: &FetchContext<'_>)
    -> Result<Option<Bytes>, FetchError>;

    fn is_file_based(&self) -> bool {
        self.kind() == SourceKind::FileBased
    }

    /// Whether the tile is available locally without any fetch.
    fn contains(&self, _coord: &TileCoord) -> bool {
        false
    }
}

/// Observer for individual source requests.
pub trait SourceListener: Send + Sync {
    fn on_request_started(&self, _coord: TileCoord, _source: &str) {}

    fn on_request_finished(&self, _coord: TileCoord, _source: &str, _bytes: usize, _elapsed: Duration) {
    }

    fn on_cache_hit(&self, _coord: TileCoord, _source: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSourceListener;

impl SourceListener for NoopSourceListener {}

/// Per-call context handed to every [`TileSource::fetch`].
pub struct FetchContext<'a> {
    listener: &'a dyn SourceListener,
    cancelled: &'a AtomicBool,
}

impl<'a> FetchContext<'a> {
    pub fn new(listener: &'a dyn SourceListener, cancelled: &'a AtomicBool) -> Self {
        Self {
            listener,
            cancelled,
        }
    }

    pub fn listener(&self) -> &dyn SourceListener {
        self.listener
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(FetchError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Applies a job's [`LoadMethod`] against the tile cache and its source.
#[derive(Clone, Default)]
pub struct TileSourceResolver {
    cache: Option<Arc<dyn TileCache>>,
}

impl TileSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Arc<dyn TileCache>) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn cache(&self) -> Option<&Arc<dyn TileCache>> {
        self.cache.as_ref()
    }

    pub fn resolve(
        &self,
        job: &DownloadJob,
        ctx: &FetchContext<'_>,
    ) -> Result<Option<Bytes>, FetchError> {
        ctx.check_cancelled()?;
        let source = job.source.as_ref();
        let coord = job.coord;

        if coord.zoom < source.min_zoom() || coord.zoom > source.max_zoom() {
            return Err(FetchError::NotFound(format!(
                "zoom {} outside {}..={} of source {}",
                coord.zoom,
                source.min_zoom(),
                source.max_zoom(),
                source.name()
            )));
        }

        match job.load_method {
            LoadMethod::Cache => Ok(self.cached(coord, source, ctx)),
            LoadMethod::Default => match self.cached(coord, source, ctx) {
                Some(bytes) => Ok(Some(bytes)),
                None => fetch_from_source(source, coord, ctx),
            },
            LoadMethod::Source => fetch_from_source(source, coord, ctx),
        }
    }

    fn cached(
        &self,
        coord: TileCoord,
        source: &dyn TileSource,
        ctx: &FetchContext<'_>,
    ) -> Option<Bytes> {
        let labels = [("subsystem", "cache"), ("op", "get")];
        let hit = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(coord, source.name()));
        match hit {
            Some(bytes) => {
                telemetry::increment_counter(tags::METRIC_CACHE_HIT_COUNT, 1, &labels);
                ctx.listener().on_cache_hit(coord, source.name());
                Some(bytes)
            }
            None => {
                telemetry::increment_counter(tags::METRIC_CACHE_MISS_COUNT, 1, &labels);
                None
            }
        }
    }
}

fn fetch_from_source(
    source: &dyn TileSource,
    coord: TileCoord,
    ctx: &FetchContext<'_>,
) -> Result<Option<Bytes>, FetchError> {
    let started = Instant::now();
    ctx.listener().on_request_started(coord, source.name());
    let result = source.fetch(coord, ctx);
    let elapsed = started.elapsed();

    let received = match &result {
        Ok(Some(bytes)) => bytes.len(),
        _ => 0,
    };
    ctx.listener()
        .on_request_finished(coord, source.name(), received, elapsed);

    let labels = [("subsystem", "source"), ("op", "fetch")];
    telemetry::increment_counter(tags::METRIC_SOURCE_FETCH_COUNT, 1, &labels);
    telemetry::increment_counter(tags::METRIC_SOURCE_FETCH_BYTES, received as u64, &labels);
    telemetry::record_histogram(
        tags::METRIC_SOURCE_FETCH_LATENCY_US,
        duration_to_us(elapsed),
        &labels,
    );

    if let Err(error) = &result {
        tracing::debug!(
            target: tags::TARGET_SOURCE,
            source = source.name(),
            tile = %coord,
            %error,
            "fetch failed"
        );
    }
    result
}
