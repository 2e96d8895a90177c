use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::error::FetchError;
use crate::types::{MAX_ZOOM, TileCoord};

use super::{FetchContext, SourceKind, TileSource};

pub const DEFAULT_TILE_SIZE: u32 = 256;

/// One layer of a [`CompositeSource`], drawn with a constant opacity.
#[derive(Clone)]
pub struct CompositeLayer {
    pub source: Arc<dyn TileSource>,
    pub alpha: f32,
}

impl CompositeLayer {
    pub fn new(source: Arc<dyn TileSource>, alpha: f32) -> Self {
        Self {
            source,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn opaque(source: Arc<dyn TileSource>) -> Self {
        Self::new(source, 1.0)
    }
}

/// Blends several sources into one PNG tile, bottom layer first.
///
/// Layers without data are skipped. If no layer has data the tile is
/// absent.
pub struct CompositeSource {
    name: String,
    layers: Vec<CompositeLayer>,
    background: Rgba<u8>,
    tile_size: u32,
}

impl CompositeSource {
    pub fn new(name: impl Into<String>, layers: Vec<CompositeLayer>) -> Self {
        Self {
            name: name.into(),
            layers,
            background: Rgba([0, 0, 0, 255]),
            tile_size: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_background(mut self, rgba: [u8; 4]) -> Self {
        self.background = Rgba(rgba);
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    pub fn layers(&self) -> &[CompositeLayer] {
        &self.layers
    }

    fn blend(&self, canvas: &mut RgbaImage, layer: &RgbaImage, alpha: f32) {
        let resized;
        let layer = if layer.dimensions() == canvas.dimensions() {
            layer
        } else {
            resized = imageops::resize(layer, self.tile_size, self.tile_size, FilterType::Triangle);
            &resized
        };

        for (dst, src) in canvas.pixels_mut().zip(layer.pixels()) {
            let src_alpha = f32::from(src[3]) / 255.0 * alpha;
            let dst_alpha = f32::from(dst[3]) / 255.0;
            let out_alpha = src_alpha + dst_alpha * (1.0 - src_alpha);
            if out_alpha <= 0.0 {
                *dst = Rgba([0, 0, 0, 0]);
                continue;
            }
            for channel in 0..3 {
                let value = (f32::from(src[channel]) * src_alpha
                    + f32::from(dst[channel]) * dst_alpha * (1.0 - src_alpha))
                    / out_alpha;
                dst[channel] = value.round().clamp(0.0, 255.0) as u8;
            }
            dst[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

impl TileSource for CompositeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Composite
    }

    fn initialize(&self) -> Result<(), FetchError> {
        self.layers
            .iter()
            .try_for_each(|layer| layer.source.initialize())
    }

    fn min_zoom(&self) -> u32 {
        self.layers
            .iter()
            .map(|layer| layer.source.min_zoom())
            .min()
            .unwrap_or(0)
    }

    fn max_zoom(&self) -> u32 {
        self.layers
            .iter()
            .map(|layer| layer.source.max_zoom())
            .max()
            .unwrap_or(MAX_ZOOM)
    }

    fn tile_location(&self, _coord: TileCoord) -> Option<String> {
        None
    }

    fn fetch(&self, coord: TileCoord, ctx: &FetchContext<'_>) -> Result<Option<Bytes>, FetchError> {
        let mut canvas: Option<RgbaImage> = None;

        for layer in &self.layers {
            ctx.check_cancelled()?;
            let source = layer.source.as_ref();
            if coord.zoom < source.min_zoom() || coord.zoom > source.max_zoom() {
                continue;
            }
            let data = match source.fetch(coord, ctx) {
                Ok(Some(data)) => data,
                Ok(None) | Err(FetchError::NotFound(_)) => continue,
                Err(error) => return Err(error),
            };
            let decoded = image::load_from_memory(&data).map_err(|error| {
                FetchError::Malformed(format!(
                    "layer {} of {} at {coord}: {error}",
                    source.name(),
                    self.name
                ))
            })?;

            let canvas = canvas.get_or_insert_with(|| {
                RgbaImage::from_pixel(self.tile_size, self.tile_size, self.background)
            });
            self.blend(canvas, &decoded.to_rgba8(), layer.alpha);
        }

        let Some(canvas) = canvas else {
            return Ok(None);
        };
        let mut encoded = Vec::new();
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|error| FetchError::Malformed(format!("encoding {coord}: {error}")))?;
        Ok(Some(Bytes::from(encoded)))
    }

    fn is_file_based(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(|layer| layer.source.is_file_based())
    }
}
