//! The clipboard history: ordered oldest to newest, unique by content,
//! bounded, and mirrored to a JSON file after every change.

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::clipboard::{ClipboardBackend, MIME_TEXT, MIME_URI_LIST};
use crate::error::HistoryError;
use crate::image::{ImageMeta, ImageSource, path_from_file_uri};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Text(String),
    /// `content` is the `file://` URI of the image.
    Image { content: String, meta: ImageMeta },
}

impl Entry {
    pub fn content(&self) -> &str {
        match self {
            Entry::Text(content) | Entry::Image { content, .. } => content,
        }
    }

    pub fn image(&self) -> Option<&ImageMeta> {
        match self {
            Entry::Text(_) => None,
            Entry::Image { meta, .. } => Some(meta),
        }
    }

    /// MIME type used when the entry is put back on the clipboard.
    pub fn clipboard_mime(&self) -> &'static str {
        match self {
            Entry::Text(_) => MIME_TEXT,
            Entry::Image { .. } => MIME_URI_LIST,
        }
    }

    /// Rebuilds an entry from its persisted form. File URIs that still
    /// point at an existing file become image entries.
    fn from_persisted(content: String) -> Self {
        let Some(path) = path_from_file_uri(&content) else {
            return Entry::Text(content);
        };

        match fs::metadata(&path) {
            Ok(stat) if stat.is_file() => Entry::Image {
                content,
                meta: ImageMeta {
                    source: ImageSource::FileSystem,
                    mime_type: "image/*".to_string(),
                    local_path: path,
                    size_bytes: stat.len(),
                },
            },
            _ => Entry::Text(content),
        }
    }
}

/// Reads the persisted history. Missing or malformed files yield an empty
/// history; duplicates keep their most recent position.
pub fn read_entries(path: &Path) -> Vec<Entry> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("No history at {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
        return Vec::new();
    }

    let contents: Vec<String> = match serde_json::from_reader(BufReader::new(file)) {
        Ok(contents) => contents,
        Err(e) => {
            error!("Ignoring unreadable history {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut newest_first: Vec<String> = contents
        .into_iter()
        .rev()
        .filter(|content| !content.is_empty() && seen.insert(content.clone()))
        .collect();
    newest_first.reverse();

    newest_first.into_iter().map(Entry::from_persisted).collect()
}

pub struct HistoryStore {
    entries: RwLock<Vec<Entry>>,
    max_entries: usize,
    path: PathBuf,
    clipboard: Arc<dyn ClipboardBackend>,
    // Generation of clipboard writes made on behalf of the history. The
    // poller samples it before reading the clipboard and drops its sample
    // if it moved by the time it commits.
    clipboard_lock: Mutex<u64>,
}

impl HistoryStore {
    /// Creates the store with an empty in-memory history, making sure the
    /// history file and its directory exist.
    pub fn new(
        path: impl Into<PathBuf>,
        max_entries: usize,
        clipboard: Arc<dyn ClipboardBackend>,
    ) -> Result<Self, HistoryError> {
        let path = path.into();
        let persist_err = |source| HistoryError::Persist {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(persist_err)?;

        Ok(Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
            path,
            clipboard,
            clipboard_lock: Mutex::new(0),
        })
    }

    /// `new`, optional `clear`, `load` and `trim_to_capacity` in startup order.
    pub fn open(
        path: impl Into<PathBuf>,
        max_entries: usize,
        clipboard: Arc<dyn ClipboardBackend>,
        clear_first: bool,
    ) -> Result<Self, HistoryError> {
        let store = Self::new(path, max_entries, clipboard)?;

        if clear_first {
            store.clear()?;
            info!("Cleared history at {}", store.path.display());
        }

        let loaded = store.load();
        let evicted = store.trim_to_capacity()?;
        info!(
            "Loaded {} history entries ({} evicted) from {}",
            loaded,
            evicted,
            store.path.display()
        );

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replaces the in-memory history with the persisted one.
    pub fn load(&self) -> usize {
        let loaded = read_entries(&self.path);
        let count = loaded.len();
        *self.entries.write() = loaded;
        count
    }

    pub fn save(&self) -> Result<(), HistoryError> {
        let entries = self.entries.read();
        self.persist(&entries)
    }

    /// Truncates the history file. The in-memory history is left alone;
    /// this is meant to run before [`load`](Self::load).
    pub fn clear(&self) -> Result<(), HistoryError> {
        let _entries = self.entries.write();
        File::create(&self.path).map_err(|source| HistoryError::Persist {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn contains(&self, content: &str) -> Option<usize> {
        self.entries
            .read()
            .iter()
            .position(|entry| entry.content() == content)
    }

    pub fn tail_content(&self) -> Option<String> {
        self.entries
            .read()
            .last()
            .map(|entry| entry.content().to_string())
    }

    pub fn get(&self, index: usize) -> Option<Entry> {
        self.entries.read().get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().clone()
    }

    /// Entries for display: newest first, paired with their history index.
    pub fn newest_first(&self, limit: usize) -> Vec<(usize, Entry)> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .rev()
            .take(limit)
            .map(|(i, entry)| (i, entry.clone()))
            .collect()
    }

    /// Substring search over entry contents, newest first.
    pub fn search(&self, query: &str, ignore_case: bool) -> Vec<(usize, Entry)> {
        let needle = if ignore_case {
            query.to_lowercase()
        } else {
            query.to_string()
        };

        self.entries
            .read()
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, entry)| {
                if ignore_case {
                    entry.content().to_lowercase().contains(&needle)
                } else {
                    entry.content().contains(&needle)
                }
            })
            .map(|(i, entry)| (i, entry.clone()))
            .collect()
    }

    /// Inserts `entry` as the newest item. An existing entry with the same
    /// content is moved rather than duplicated; overflow is evicted from the
    /// oldest end.
    pub fn upsert(&self, entry: Entry) -> Result<(), HistoryError> {
        let mut entries = self.entries.write();

        if let Some(index) = entries.iter().position(|e| e.content() == entry.content()) {
            entries.remove(index);
        }
        entries.push(entry);

        let overflow = entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            entries.drain(..overflow);
        }

        self.persist(&entries)
    }

    /// Drops the oldest entries beyond capacity. Returns how many went.
    pub fn trim_to_capacity(&self) -> Result<usize, HistoryError> {
        let mut entries = self.entries.write();

        let overflow = entries.len().saturating_sub(self.max_entries);
        if overflow == 0 {
            return Ok(0);
        }

        entries.drain(..overflow);
        self.persist(&entries)?;
        Ok(overflow)
    }

    /// Removes the entry at `index`. Removing the newest entry puts the new
    /// newest entry back on the clipboard before returning, so the poller
    /// does not pick the deleted value up again. The removal stands even
    /// when persisting or restoring the clipboard fails; both are reported.
    pub async fn remove_at(&self, index: usize) -> Result<usize, HistoryError> {
        let mut generation = self.clipboard_lock.lock().await;

        let (new_tail, was_tail, persisted) = {
            let mut entries = self.entries.write();
            let len = entries.len();
            if index >= len {
                return Err(HistoryError::NotFound { index, len });
            }

            entries.remove(index);
            let was_tail = index == len - 1;
            (entries.last().cloned(), was_tail, self.persist(&entries))
        };
        *generation += 1;

        if was_tail {
            let restored = match &new_tail {
                Some(tail) => self.clipboard.write(tail.content(), tail.clipboard_mime()).await,
                None => self.clipboard.clear().await,
            };
            if let Err(e) = restored {
                warn!("Could not restore clipboard after deleting newest entry: {}", e);
                persisted?;
                return Err(e.into());
            }
        }

        persisted.map(|()| index)
    }

    /// Copies the entry at `index` to the clipboard and makes it the newest.
    pub async fn select(&self, index: usize) -> Result<Entry, HistoryError> {
        let mut generation = self.clipboard_lock.lock().await;

        let (entry, persisted) = {
            let mut entries = self.entries.write();
            let len = entries.len();
            if index >= len {
                return Err(HistoryError::NotFound { index, len });
            }

            let entry = entries.remove(index);
            entries.push(entry.clone());
            (entry, self.persist(&entries))
        };
        *generation += 1;

        self.clipboard
            .write(entry.content(), entry.clipboard_mime())
            .await?;
        persisted.map(|()| entry)
    }

    /// Current clipboard-write generation, read under the clipboard lock so
    /// it never observes a delete whose clipboard write is still pending.
    pub(crate) async fn clipboard_generation(&self) -> u64 {
        *self.clipboard_lock.lock().await
    }

    /// Held by the poller around its commit step.
    pub(crate) async fn lock_clipboard(&self) -> MutexGuard<'_, u64> {
        self.clipboard_lock.lock().await
    }

    fn persist(&self, entries: &[Entry]) -> Result<(), HistoryError> {
        let result = self.write_file(entries);
        if let Err(e) = &result {
            error!("Could not save clipboard history: {}", e);
        }
        result
    }

    fn write_file(&self, entries: &[Entry]) -> Result<(), HistoryError> {
        let persist_err = |source| HistoryError::Persist {
            path: self.path.clone(),
            source,
        };

        let contents: Vec<&str> = entries
            .iter()
            .map(Entry::content)
            .filter(|content| !content.is_empty())
            .collect();

        let file = File::create(&self.path).map_err(persist_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &contents)?;
        writer.write_all(b"\n").map_err(persist_err)?;
        writer.flush().map_err(persist_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::image::file_uri;
    use tempfile::TempDir;

    fn text(s: &str) -> Entry {
        Entry::Text(s.to_string())
    }

    fn contents(store: &HistoryStore) -> Vec<String> {
        store
            .snapshot()
            .iter()
            .map(|e| e.content().to_string())
            .collect()
    }

    fn persisted(path: &Path) -> Vec<String> {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn store_with(
        dir: &TempDir,
        max_entries: usize,
        initial: &[&str],
    ) -> (HistoryStore, Arc<MemoryClipboard>) {
        let path = dir.path().join("history.json");
        fs::write(&path, serde_json::to_string(initial).unwrap()).unwrap();
        let clipboard = Arc::new(MemoryClipboard::new());
        let store = HistoryStore::open(&path, max_entries, clipboard.clone(), false).unwrap();
        (store, clipboard)
    }

    #[test]
    fn load_trims_oldest_and_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 3, &["a", "b", "c", "d"]);

        assert_eq!(contents(&store), vec!["b", "c", "d"]);
        assert_eq!(persisted(store.path()), vec!["b", "c", "d"]);
    }

    #[test]
    fn upsert_moves_existing_content_to_tail() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["x", "y"]);

        store.upsert(text("x")).unwrap();

        assert_eq!(contents(&store), vec!["y", "x"]);
        assert_eq!(persisted(store.path()), vec!["y", "x"]);
    }

    #[test]
    fn upsert_never_duplicates_and_stays_bounded() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 4, &[]);

        for value in ["a", "b", "a", "c", "d", "b", "e", "e", "f"] {
            store.upsert(text(value)).unwrap();
            let all = contents(&store);
            let unique: HashSet<_> = all.iter().collect();
            assert_eq!(unique.len(), all.len());
            assert!(all.len() <= 4);
            assert_eq!(all.last().unwrap(), value);
        }

        assert_eq!(contents(&store), vec!["d", "b", "e", "f"]);
    }

    #[test]
    fn save_then_load_round_trips_text() {
        let dir = TempDir::new().unwrap();
        let (store, clipboard) = store_with(&dir, 10, &[]);
        for value in ["one", "two\nlines", "  padded  ", "ünïcödé"] {
            store.upsert(text(value)).unwrap();
        }
        store.save().unwrap();

        let reopened = HistoryStore::open(store.path(), 10, clipboard, false).unwrap();
        assert_eq!(contents(&reopened), contents(&store));
    }

    #[test]
    fn load_attaches_image_meta_to_existing_files() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("pic.png");
        fs::write(&image, b"12345").unwrap();
        let uri = file_uri(&image);
        let gone = file_uri(&dir.path().join("gone.png"));

        let (store, _) = store_with(&dir, 10, &["hello", uri.as_str(), gone.as_str()]);
        let entries = store.snapshot();

        assert_eq!(entries[0], text("hello"));
        let meta = entries[1].image().unwrap();
        assert_eq!(meta.source, ImageSource::FileSystem);
        assert_eq!(meta.mime_type, "image/*");
        assert_eq!(meta.local_path, image);
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(entries[2], Entry::Text(gone));
    }

    #[test]
    fn malformed_or_empty_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, "{not json").unwrap();
        assert!(read_entries(&path).is_empty());

        fs::write(&path, "").unwrap();
        assert!(read_entries(&path).is_empty());

        assert!(read_entries(&dir.path().join("missing.json")).is_empty());
    }

    #[test]
    fn duplicate_lines_keep_newest_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, r#"["a","b","a","","c"]"#).unwrap();

        let loaded: Vec<String> = read_entries(&path)
            .iter()
            .map(|e| e.content().to_string())
            .collect();
        assert_eq!(loaded, vec!["b", "a", "c"]);
    }

    #[test]
    fn clear_truncates_file_only() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["a", "b"]);

        store.clear().unwrap();

        assert_eq!(fs::read_to_string(store.path()).unwrap(), "");
        assert_eq!(store.len(), 2);
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn open_with_clear_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, r#"["a","b"]"#).unwrap();

        let store =
            HistoryStore::open(&path, 10, Arc::new(MemoryClipboard::new()), true).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn contains_reports_index() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["a", "b", "c"]);

        assert_eq!(store.contains("b"), Some(1));
        assert_eq!(store.contains("z"), None);
        assert_eq!(store.tail_content().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn removing_tail_restores_clipboard() {
        let dir = TempDir::new().unwrap();
        let (store, clipboard) = store_with(&dir, 10, &["a", "b", "c"]);

        assert_eq!(store.remove_at(2).await.unwrap(), 2);

        assert_eq!(contents(&store), vec!["a", "b"]);
        assert_eq!(clipboard.current().as_deref(), Some("b"));
        assert_eq!(
            clipboard.writes(),
            vec![("b".to_string(), MIME_TEXT.to_string())]
        );
        assert_eq!(persisted(store.path()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_clipboard_restore_is_reported_but_removal_stands() {
        let dir = TempDir::new().unwrap();
        let (store, clipboard) = store_with(&dir, 10, &["a", "b", "c"]);
        clipboard.set("c", &["text/plain"]);
        clipboard.set_unavailable(true);

        let err = store.remove_at(2).await.unwrap_err();

        assert!(matches!(err, HistoryError::Clipboard(_)));
        assert_eq!(contents(&store), vec!["a", "b"]);
        assert_eq!(persisted(store.path()), vec!["a", "b"]);
        assert_eq!(store.clipboard_generation().await, 1);
    }

    #[tokio::test]
    async fn removing_other_entries_leaves_clipboard_alone() {
        let dir = TempDir::new().unwrap();
        let (store, clipboard) = store_with(&dir, 10, &["a", "b", "c"]);

        store.remove_at(0).await.unwrap();

        assert_eq!(contents(&store), vec!["b", "c"]);
        assert!(clipboard.writes().is_empty());
        assert_eq!(persisted(store.path()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn removing_last_remaining_entry_clears_clipboard() {
        let dir = TempDir::new().unwrap();
        let (store, clipboard) = store_with(&dir, 10, &["only"]);
        clipboard.set("only", &["text/plain"]);

        store.remove_at(0).await.unwrap();

        assert!(store.is_empty());
        assert_eq!(clipboard.current(), None);
    }

    #[tokio::test]
    async fn remove_out_of_range_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["a"]);

        let err = store.remove_at(1).await.unwrap_err();
        assert!(matches!(err, HistoryError::NotFound { index: 1, len: 1 }));
        assert_eq!(contents(&store), vec!["a"]);
    }

    #[tokio::test]
    async fn select_promotes_and_copies() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("pic.png");
        fs::write(&image, b"png").unwrap();
        let uri = file_uri(&image);
        let (store, clipboard) = store_with(&dir, 10, &[uri.as_str(), "b", "c"]);

        let selected = store.select(0).await.unwrap();

        assert_eq!(selected.content(), uri);
        assert_eq!(contents(&store), vec!["b".to_string(), "c".to_string(), uri.clone()]);
        assert_eq!(clipboard.writes(), vec![(uri, MIME_URI_LIST.to_string())]);
    }

    #[test]
    fn search_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["Apple pie", "banana", "apple juice"]);

        let hits: Vec<usize> = store.search("apple", true).iter().map(|(i, _)| *i).collect();
        assert_eq!(hits, vec![2, 0]);

        let exact: Vec<usize> = store.search("apple", false).iter().map(|(i, _)| *i).collect();
        assert_eq!(exact, vec![2]);

        let listed: Vec<usize> = store.newest_first(2).iter().map(|(i, _)| *i).collect();
        assert_eq!(listed, vec![2, 1]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persistence_failure_keeps_memory_change() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 10, &["a", "b", "c"]);
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o400)).unwrap();

        // root ignores file modes; nothing to observe then
        if File::create(store.path()).is_ok() {
            return;
        }

        let result = store.remove_at(0).await;
        assert!(matches!(result, Err(HistoryError::Persist { .. })));
        assert_eq!(contents(&store), vec!["b", "c"]);
    }
}
