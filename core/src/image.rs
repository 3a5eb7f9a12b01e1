//! Image classification and the local image cache.
//!
//! Clipboard images reach the history as `file://` URIs. Images dragged out
//! of a browser arrive as an HTML fragment and are downloaded into the cache
//! directory; images copied from a file manager already live on disk.

use log::{debug, info, warn};
use regex::Regex;
use reqwest::Url;
use reqwest::header::USER_AGENT;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::clipboard::ClipboardBackend;
use crate::error::ImageError;

const FILE_SCHEME: &str = "file://";
const BROWSER_MARKER: &str = "-moz-url";
const URI_LIST: &str = "text/uri-list";
const ANY_IMAGE: &str = "image/*";

static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]+src=["']?([^"' >]+)["']?"#).expect("valid <img> pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Dragged from a web page; the bytes have to be fetched.
    Browser,
    /// Already a local file.
    FileSystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub source: ImageSource,
    pub mime_type: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// What the MIME listing says about the current clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// `None` when only a raw `image/*` offering was seen.
    pub source: Option<ImageSource>,
    pub mime_type: String,
}

impl ProbeResult {
    pub fn effective_source(&self) -> ImageSource {
        self.source.unwrap_or(ImageSource::FileSystem)
    }
}

/// Where an image entry lives, computed without touching disk or network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub uri: String,
    pub local_path: PathBuf,
    /// Remote URL the cache file is populated from, for browser images.
    pub origin: Option<String>,
}

/// Classifies a `wl-paste --list-types` listing. The first line carrying
/// an image signal decides.
pub fn probe(types: &[String]) -> Option<ProbeResult> {
    for line in types {
        let mut source = None;
        let mut mime_type = None;

        if line.starts_with(BROWSER_MARKER) {
            source = Some(ImageSource::Browser);
            mime_type = Some(ANY_IMAGE.to_string());
        } else if line.starts_with(URI_LIST) {
            source = Some(ImageSource::FileSystem);
            mime_type = Some(ANY_IMAGE.to_string());
        }

        if line.starts_with("image/") {
            mime_type = Some(line.clone());
        }

        if let Some(mime_type) = mime_type {
            return Some(ProbeResult { source, mime_type });
        }
    }

    None
}

pub fn extract_img_src(fragment: &str) -> Option<String> {
    IMG_SRC
        .captures(fragment)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// `file://` URI for a local path, always with forward slashes.
pub fn file_uri(path: &Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(()) => format!(
            "{}{}",
            FILE_SCHEME,
            path.to_string_lossy().replace('\\', "/")
        ),
    }
}

/// Inverse of [`file_uri`]; `None` for anything that is not a local file URI.
pub fn path_from_file_uri(content: &str) -> Option<PathBuf> {
    let url = Url::parse(content).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

pub struct ImageResolver {
    cache_dir: PathBuf,
    user_agent: String,
    http: reqwest::Client,
}

impl ImageResolver {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        user_agent: impl Into<String>,
        download_timeout: Duration,
    ) -> Result<Self, ImageError> {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .map_err(ImageError::HttpClient)?;

        Ok(Self {
            cache_dir: cache_dir.into(),
            user_agent: user_agent.into(),
            http,
        })
    }

    /// Lists the clipboard offerings and classifies them. A failing listing
    /// is treated as "no image".
    pub async fn probe_clipboard(&self, clipboard: &dyn ClipboardBackend) -> Option<ProbeResult> {
        match clipboard.list_types().await {
            Ok(types) => probe(&types),
            Err(e) => {
                debug!("MIME listing unavailable: {}", e);
                None
            }
        }
    }

    /// Cache file for a remote image: the URL basename without its query.
    pub fn cache_path(&self, origin: &str) -> Result<PathBuf, ImageError> {
        let name = strip_query(origin)
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();

        if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
            return Err(ImageError::InvalidOrigin(origin.to_string()));
        }

        Ok(self.cache_dir.join(name))
    }

    pub fn locate(&self, raw: &str, probe: &ProbeResult) -> Result<Location, ImageError> {
        if raw.starts_with(FILE_SCHEME) {
            let local_path = path_from_file_uri(raw)
                .unwrap_or_else(|| PathBuf::from(&raw[FILE_SCHEME.len()..]));
            return Ok(Location {
                uri: raw.to_string(),
                local_path,
                origin: None,
            });
        }

        match probe.effective_source() {
            ImageSource::Browser => {
                let origin = extract_img_src(raw).ok_or(ImageError::MissingSource)?;
                let local_path = self.cache_path(&origin)?;
                Ok(Location {
                    uri: file_uri(&local_path),
                    local_path,
                    origin: Some(origin),
                })
            }
            ImageSource::FileSystem => {
                let local_path = PathBuf::from(raw);
                Ok(Location {
                    uri: file_uri(&local_path),
                    local_path,
                    origin: None,
                })
            }
        }
    }

    /// Materialises the image behind `raw`, downloading browser images into
    /// the cache when they are not there yet.
    pub async fn resolve(
        &self,
        raw: &str,
        probe: ProbeResult,
    ) -> Result<(String, ImageMeta), ImageError> {
        let location = self.locate(raw, &probe)?;

        let size_bytes = match &location.origin {
            Some(origin) => self.fetch_into_cache(origin, &location.local_path).await?,
            None => match tokio::fs::metadata(&location.local_path).await {
                Ok(stat) if stat.is_file() => stat.len(),
                _ => return Err(ImageError::MissingFile(location.local_path)),
            },
        };

        let meta = ImageMeta {
            source: probe.effective_source(),
            mime_type: probe.mime_type,
            local_path: location.local_path,
            size_bytes,
        };

        Ok((location.uri, meta))
    }

    async fn fetch_into_cache(&self, origin: &str, path: &Path) -> Result<u64, ImageError> {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            debug!("Reusing cached image {}", path.display());
            return Ok(meta.len());
        }

        let network = |source| ImageError::Network {
            url: origin.to_string(),
            source,
        };

        let response = self
            .http
            .get(origin)
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!("Image download failed for {}: {}", origin, e);
                network(e)
            })?;

        let body = response.bytes().await.map_err(network)?;

        let cache_err = |source| ImageError::Cache {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(cache_err)?;
        tokio::fs::write(path, &body).await.map_err(cache_err)?;

        info!("Cached {} ({} bytes)", path.display(), body.len());
        Ok(body.len() as u64)
    }
}
