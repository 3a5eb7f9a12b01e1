//! Background loop feeding new clipboard content into the history.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clipboard::ClipboardBackend;
use crate::history::{Entry, HistoryStore};
use crate::image::ImageResolver;

/// Outcome of a single sampling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// The clipboard could not be read; retried on the next tick.
    Unavailable,
    Blank,
    Unchanged,
    /// A delete or select rewrote the clipboard while this sample was taken.
    Superseded,
    Added(String),
}

pub struct ClipboardPoller {
    store: Arc<HistoryStore>,
    resolver: Arc<ImageResolver>,
    clipboard: Arc<dyn ClipboardBackend>,
    interval: Duration,
}

impl ClipboardPoller {
    pub fn new(
        store: Arc<HistoryStore>,
        resolver: Arc<ImageResolver>,
        clipboard: Arc<dyn ClipboardBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            clipboard,
            interval,
        }
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Watching clipboard every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Tick::Added(content) = self.tick().await {
                        debug!("New clipboard entry ({} bytes)", content.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Clipboard poller stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// One sampling step. No lock is held while the clipboard tools or the
    /// image download run; the clipboard lock is only taken to check that
    /// no history-driven clipboard write happened since sampling, and to
    /// commit.
    pub async fn tick(&self) -> Tick {
        let generation = self.store.clipboard_generation().await;

        let raw = match self.clipboard.read_text().await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Skipping tick: {}", e);
                return Tick::Unavailable;
            }
        };

        let content = raw.trim();
        if content.is_empty() {
            return Tick::Blank;
        }

        let tail = self.store.tail_content();
        let is_tail = |candidate: &str| tail.as_deref() == Some(candidate);

        let entry = match self.resolver.probe_clipboard(self.clipboard.as_ref()).await {
            Some(probe) => {
                let location = match self.resolver.locate(content, &probe) {
                    Ok(location) => location,
                    Err(e) => {
                        debug!("Not an image after all ({}), keeping text", e);
                        if is_tail(content) {
                            return Tick::Unchanged;
                        }
                        return self.commit(Entry::Text(content.to_string()), generation).await;
                    }
                };

                // a failed download leaves the origin URL as the tail
                if is_tail(&location.uri) || location.origin.as_deref().is_some_and(is_tail) {
                    return Tick::Unchanged;
                }

                match self.resolver.resolve(content, probe).await {
                    Ok((uri, meta)) => Entry::Image { content: uri, meta },
                    Err(e) => {
                        let fallback = location.origin.unwrap_or_else(|| content.to_string());
                        warn!("Image unavailable ({}), storing {} as text", e, fallback);
                        if is_tail(&fallback) {
                            return Tick::Unchanged;
                        }
                        Entry::Text(fallback)
                    }
                }
            }
            None => {
                if is_tail(content) {
                    return Tick::Unchanged;
                }
                Entry::Text(content.to_string())
            }
        };

        self.commit(entry, generation).await
    }

    async fn commit(&self, entry: Entry, sampled_at: u64) -> Tick {
        let generation = self.store.lock_clipboard().await;
        if *generation != sampled_at {
            debug!("Clipboard rewritten by the history since sampling, dropping sample");
            return Tick::Superseded;
        }

        let content = entry.content().to_string();
        if self.store.tail_content().as_deref() == Some(content.as_str()) {
            return Tick::Unchanged;
        }

        // failures are logged by the store; the entry stays in memory
        let _ = self.store.upsert(entry);
        Tick::Added(content)
    }
}
