use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::history::HistoryStore;
use crate::image::file_uri;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, std::io::Error)>,
}

/// Deletes cached images that no history entry refers to any more.
/// A file that cannot be deleted is reported and the scan goes on.
pub fn clean_cache(store: &HistoryStore, cache_dir: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();

    let dir = match fs::read_dir(cache_dir) {
        Ok(dir) => dir,
        Err(e) => {
            debug!("Image cache {} not readable: {}", cache_dir.display(), e);
            return report;
        }
    };

    for item in dir.flatten() {
        let path = item.path();
        if !item.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        report.scanned += 1;

        if store.contains(&file_uri(&path)).is_some() {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(path),
            Err(e) => {
                warn!("Could not remove orphaned image {}: {}", path.display(), e);
                report.failed.push((path, e));
            }
        }
    }

    info!(
        "Image cache: {} files scanned, {} orphans removed",
        report.scanned,
        report.removed.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn keeps_referenced_files_and_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("images");
        fs::create_dir_all(cache.join("nested")).unwrap();
        for name in ["kept.png", "orphan.png", "also orphan.gif"] {
            fs::write(cache.join(name), b"x").unwrap();
        }

        let kept = file_uri(&cache.join("kept.png"));
        let history = dir.path().join("history.json");
        fs::write(&history, serde_json::to_string(&["text", kept.as_str()]).unwrap()).unwrap();
        let store = HistoryStore::open(&history, 10, Arc::new(MemoryClipboard::new()), false).unwrap();

        let report = clean_cache(&store, &cache);

        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert!(cache.join("kept.png").exists());
        assert!(!cache.join("orphan.png").exists());
        assert!(!cache.join("also orphan.gif").exists());
        assert!(cache.join("nested").is_dir());
    }

    #[test]
    fn missing_cache_dir_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(
            dir.path().join("history.json"),
            10,
            Arc::new(MemoryClipboard::new()),
        )
        .unwrap();

        let report = clean_cache(&store, &dir.path().join("nope"));
        assert_eq!(report.scanned, 0);
        assert!(report.removed.is_empty());
    }
}
