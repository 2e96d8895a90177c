use std::sync::Arc;

use bytes::Bytes;

use crate::config::HttpOptions;
use crate::error::FetchError;
use crate::types::{MAX_ZOOM, TileCoord};
use crate::{Result, TesseraError};

use super::{FetchContext, SourceKind, TileSource};

/// Raw answer from an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Blocking HTTP transport used by [`HttpSource`].
///
/// Only transport problems are errors here; status codes are interpreted by
/// the source.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> std::result::Result<HttpResponse, FetchError>;
}

/// [`HttpClient`] backed by `reqwest::blocking`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
    accept: String,
}

impl ReqwestClient {
    pub fn new(options: &HttpOptions) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(options.connect_timeout())
            .timeout(options.connect_timeout() + options.read_timeout())
            .user_agent(options.user_agent.as_str());

        if let Some(path) = &options.pinned_certificate {
            let pem = std::fs::read(path).map_err(|error| {
                TesseraError::Io(error).with_context(format!("read certificate {}", path.display()))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|error| {
                TesseraError::Config(format!("invalid certificate {}: {error}", path.display()))
            })?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|error| TesseraError::Config(format!("failed to create HTTP client: {error}")))?;
        Ok(Self {
            client,
            accept: options.accept.clone(),
        })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, headers: &[(String, String)]) -> std::result::Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url).header(reqwest::header::ACCEPT, &self.accept);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().map_err(|error| transport_error(url, &error))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes()
            .map_err(|error| FetchError::Transient(format!("reading {url}: {error}")))?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

fn transport_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::Misconfigured(format!("invalid request for {url}: {error}"))
    } else {
        FetchError::Transient(format!("request to {url} failed: {error}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Zoom,
    X,
    Y,
    FlippedY,
    Quadkey,
}

/// Tile URL pattern with `{z}`, `{x}`, `{y}`, `{-y}` and `{q}` placeholders.
///
/// ```
/// use tessera_core::source::UrlTemplate;
/// use tessera_core::TileCoord;
///
/// let template = UrlTemplate::parse("https://tiles.example/{z}/{x}/{-y}.png")?;
/// assert_eq!(template.expand(TileCoord::new(2, 1, 0)), "https://tiles.example/2/1/3.png");
/// # Ok::<(), tessera_core::TesseraError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                return Err(TesseraError::Config(format!("unclosed placeholder in {raw}")));
            };
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let segment = match &rest[start + 1..start + len] {
                "z" | "zoom" => Segment::Zoom,
                "x" => Segment::X,
                "y" => Segment::Y,
                "-y" => Segment::FlippedY,
                "q" | "quadkey" => Segment::Quadkey,
                other => {
                    return Err(TesseraError::Config(format!(
                        "unknown placeholder {{{other}}} in {raw}"
                    )));
                }
            };
            segments.push(segment);
            rest = &rest[start + len + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        let addresses_tile = segments.contains(&Segment::Quadkey)
            || (segments.contains(&Segment::X)
                && (segments.contains(&Segment::Y) || segments.contains(&Segment::FlippedY)));
        if !addresses_tile {
            return Err(TesseraError::Config(format!(
                "url template {raw} does not address individual tiles"
            )));
        }

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    pub fn expand(&self, coord: TileCoord) -> String {
        let mut url = String::with_capacity(self.raw.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Zoom => url.push_str(&coord.zoom.to_string()),
                Segment::X => url.push_str(&coord.x.to_string()),
                Segment::Y => url.push_str(&coord.y.to_string()),
                Segment::FlippedY => url.push_str(&coord.tms_y().to_string()),
                Segment::Quadkey => url.push_str(&coord.quadkey()),
            }
        }
        url
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Map source served by a tile server over HTTP.
pub struct HttpSource {
    name: String,
    template: UrlTemplate,
    client: Arc<dyn HttpClient>,
    headers: Vec<(String, String)>,
    min_zoom: u32,
    max_zoom: u32,
    ignore_content_mismatch: bool,
}

impl HttpSource {
    pub fn new(name: impl Into<String>, template: UrlTemplate, client: Arc<dyn HttpClient>) -> Self {
        Self {
            name: name.into(),
            template,
            client,
            headers: Vec::new(),
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

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Accept responses whose content type is not an image.
    pub fn ignore_content_mismatch(mut self, ignore: bool) -> Self {
        self.ignore_content_mismatch = ignore;
        self
    }

    pub fn template(&self) -> &UrlTemplate {
        &self.template
    }
}

impl TileSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Http
    }

    fn min_zoom(&self) -> u32 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u32 {
        self.max_zoom
    }

    fn tile_location(&self, coord: TileCoord) -> Option<String> {
        Some(self.template.expand(coord))
    }

    fn fetch(&self, coord: TileCoord, ctx: &FetchContext<'_>) -> std::result::Result<Option<Bytes>, FetchError> {
        ctx.check_cancelled()?;
        let url = self.template.expand(coord);
        let response = self.client.get(&url, &self.headers)?;
        classify_response(&url, response, self.ignore_content_mismatch)
    }
}

/// Maps an HTTP answer onto the fetch taxonomy.
pub(crate) fn classify_response(
    url: &str,
    response: HttpResponse,
    ignore_content_mismatch: bool,
) -> std::result::Result<Option<Bytes>, FetchError> {
    match response.status {
        204 | 404 | 410 => Err(FetchError::NotFound(format!(
            "HTTP {} from {url}",
            response.status
        ))),
        408 | 429 | 500..=599 => Err(FetchError::Transient(format!(
            "HTTP {} from {url}",
            response.status
        ))),
        200..=299 => {
            if response.body.is_empty() {
                return Ok(None);
            }
            let is_image = response
                .content_type
                .as_deref()
                .is_none_or(|value| value.trim_start().to_ascii_lowercase().starts_with("image/"));
            if !is_image && !ignore_content_mismatch {
                return Err(FetchError::Malformed(format!(
                    "unexpected content type {} from {url}",
                    response.content_type.as_deref().unwrap_or_default()
                )));
            }
            Ok(Some(response.body))
        }
        status => Err(FetchError::Malformed(format!("HTTP {status} from {url}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, content_type: Option<&str>, body: &'static [u8]) -> HttpResponse {
        HttpResponse {
            status,
            content_type: content_type.map(str::to_owned),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert!(matches!(
            classify_response("u", response(404, None, b""), false),
            Err(FetchError::NotFound(_))
        ));
        assert!(matches!(
            classify_response("u", response(503, None, b""), false),
            Err(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_response("u", response(429, None, b""), false),
            Err(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_response("u", response(403, None, b""), false),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn content_mismatch_can_be_ignored() {
        let html = || response(200, Some("text/html"), b"<html>");
        assert!(matches!(
            classify_response("u", html(), false),
            Err(FetchError::Malformed(_))
        ));
        assert_eq!(
            classify_response("u", html(), true).ok().flatten(),
            Some(Bytes::from_static(b"<html>"))
        );
    }

    #[test]
    fn template_rejects_unknown_placeholders() {
        assert!(UrlTemplate::parse("http://a/{z}/{x}/{lat}").is_err());
        assert!(UrlTemplate::parse("http://a/static.png").is_err());
        let template = UrlTemplate::parse("http://a/{q}.jpeg").unwrap();
        assert_eq!(template.expand(TileCoord::new(3, 3, 5)), "http://a/213.jpeg");
    }
}
