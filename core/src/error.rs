use std::path::PathBuf;
use thiserror::Error;

/// Failures of the external clipboard tools.
#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {stderr}")]
    Status {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("clipboard payload is not valid UTF-8")]
    NotText,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("no <img> source found in clipboard fragment")]
    MissingSource,

    #[error("no image file at {0}")]
    MissingFile(PathBuf),

    #[error("cannot derive a cache file name from {0}")]
    InvalidOrigin(String),

    #[error("download of {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to write {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no entry at index {index} (history holds {len})")]
    NotFound { index: usize, len: usize },

    #[error("failed to persist history to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Clipboard(#[from] ClipboardError),
}
