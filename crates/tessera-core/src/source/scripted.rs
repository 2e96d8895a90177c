use std::sync::Arc;

use bytes::Bytes;

use crate::error::FetchError;
use crate::telemetry::tags;
use crate::types::{MAX_ZOOM, TileCoord};

use super::http::classify_response;
use super::{FetchContext, HttpClient, SourceKind, TileSource};

/// Request produced by a [`TileScript`] for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl TileRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// User-supplied logic behind a [`ScriptedSource`].
pub trait TileScript: Send + Sync {
    /// `Ok(None)` means the script has no tile at this coordinate.
    fn tile_request(&self, coord: TileCoord) -> Result<Option<TileRequest>, FetchError>;

    /// When true, every failure is reported as "no data" instead.
    fn ignore_errors(&self) -> bool {
        false
    }
}

pub struct ScriptedSource {
    name: String,
    script: Arc<dyn TileScript>,
    client: Arc<dyn HttpClient>,
    min_zoom: u32,
    max_zoom: u32,
    ignore_content_mismatch: bool,
}

impl ScriptedSource {
    pub fn new(
        name: impl Into<String>,
        script: Arc<dyn TileScript>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            name: name.into(),
            script,
            client,
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
            ignore_content_mismatch: false,
        }
    }

    pub fn with_zoom_range(mut self, min_zoom: u32, max_zoom: u32) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom.min(MAX_ZOOM);
        self
    }

    pub fn ignore_content_mismatch(mut self, ignore: bool) -> Self {
        self.ignore_content_mismatch = ignore;
        self
    }

    fn fetch_inner(&self, coord: TileCoord, ctx: &FetchContext<'_>) -> Result<Option<Bytes>, FetchError> {
        ctx.check_cancelled()?;
        let Some(request) = self.script.tile_request(coord)? else {
            return Ok(None);
        };
        let response = self.client.get(&request.url, &request.headers)?;
        classify_response(&request.url, response, self.ignore_content_mismatch)
    }
}

impl TileSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Scripted
    }

    fn min_zoom(&self) -> u32 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u32 {
        self.max_zoom
    }

    fn tile_location(&self, coord: TileCoord) -> Option<String> {
        self.script
            .tile_request(coord)
            .ok()
            .flatten()
            .map(|request| request.url)
    }

    fn fetch(&self, coord: TileCoord, ctx: &FetchContext<'_>) -> Result<Option<Bytes>, FetchError> {
        match self.fetch_inner(coord, ctx) {
            Err(FetchError::Cancelled) => Err(FetchError::Cancelled),
            Err(error) if self.script.ignore_errors() => {
                tracing::debug!(
                    target: tags::TARGET_SOURCE,
                    source = %self.name,
                    tile = %coord,
                    %error,
                    "scripted source error ignored"
                );
                Ok(None)
            }
            other => other,
        }
    }
}
