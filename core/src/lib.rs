//! Clipboard history engine: polls the Wayland clipboard, keeps a bounded
//! deduplicated history on disk, caches images and makes sure only one
//! instance runs per user.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;

pub mod clipboard;
pub mod config;
pub mod error;
pub mod history;
pub mod image;
#[cfg(unix)]
pub mod instance;
pub mod janitor;
pub mod poller;

pub use clipboard::{ClipboardBackend, MemoryClipboard, WlClipboard};
pub use config::Config;
pub use error::{ClipboardError, HistoryError, ImageError};
pub use history::{Entry, HistoryStore};
pub use image::{ImageMeta, ImageResolver, ImageSource, ProbeResult};
pub use poller::ClipboardPoller;

pub const PREVIEW_CHARS: usize = 100;

/// Owns the history and its collaborators for the lifetime of the daemon.
pub struct ClipboardManager {
    config: Config,
    store: Arc<HistoryStore>,
    resolver: Arc<ImageResolver>,
    clipboard: Arc<dyn ClipboardBackend>,
}

impl ClipboardManager {
    /// Opens the history (clearing it first if asked), trims it to capacity
    /// and drops cached images it no longer references.
    pub fn new(
        config: Config,
        clipboard: Arc<dyn ClipboardBackend>,
        clear_history: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!("Failed to create cache dir {}", config.cache_dir.display())
        })?;

        let store = HistoryStore::open(
            config.history_path(),
            config.max_entries,
            clipboard.clone(),
            clear_history,
        )
        .context("Failed to open clipboard history")?;

        let report = janitor::clean_cache(&store, &config.cache_dir);
        if !report.failed.is_empty() {
            warn!("{} cached images could not be removed", report.failed.len());
        }

        let resolver = ImageResolver::new(
            &config.cache_dir,
            config.user_agent.clone(),
            config.download_timeout(),
        )?;

        Ok(Self {
            config,
            store: Arc::new(store),
            resolver: Arc::new(resolver),
            clipboard,
        })
    }

    pub fn store(&self) -> Arc<HistoryStore> {
        self.store.clone()
    }

    pub fn poller(&self) -> ClipboardPoller {
        ClipboardPoller::new(
            self.store.clone(),
            self.resolver.clone(),
            self.clipboard.clone(),
            self.config.poll_interval(),
        )
    }

    /// Runs the poller and answers show requests until the future is
    /// dropped. Dropping it stops the poller and removes the socket.
    #[cfg(unix)]
    pub async fn run_daemon<F>(&self, signal: instance::InstanceSignal, on_show: F) -> Result<()>
    where
        F: Fn() + Send + Sync,
    {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = self.poller().spawn(shutdown_rx);

        let result = signal.serve(on_show).await;
        poller.abort();
        result
    }
}

/// Single-line rendering of an entry for pickers and logs.
pub fn preview(entry: &Entry, max_chars: usize) -> String {
    match entry {
        Entry::Image { meta, .. } => {
            let name = meta
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("[Image: {} {}]", name, format_size(meta.size_bytes))
        }
        Entry::Text(text) => truncate_to_fit(text, max_chars),
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / (1024 * 1024))
    }
}

fn truncate_to_fit(text: &str, max_chars: usize) -> String {
    let text = text.replace('\n', "↲").replace('\t', " ");

    if text.chars().count() <= max_chars {
        text
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

/// Logs a show request; used when no display layer is attached.
pub fn log_show_request(store: &HistoryStore) {
    let tail = store
        .tail_content()
        .map(|t| truncate_to_fit(&t, 40))
        .unwrap_or_default();
    info!("Show requested: {} entries, newest {:?}", store.len(), tail);
}
