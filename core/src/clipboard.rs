//! Access to the system clipboard through the `wl-clipboard` tools.
//!
//! The history engine never talks to the compositor itself. Everything it
//! needs from the clipboard goes through [`ClipboardBackend`], which the
//! daemon implements with `wl-paste`/`wl-copy` subprocesses and tests
//! implement in memory.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ClipboardError;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_URI_LIST: &str = "text/uri-list";

const WL_PASTE: &str = "wl-paste";
const WL_COPY: &str = "wl-copy";

#[async_trait]
pub trait ClipboardBackend: Send + Sync {
    /// Current clipboard text.
    async fn read_text(&self) -> Result<String, ClipboardError>;

    /// MIME types currently offered, one per element, in offer order.
    async fn list_types(&self) -> Result<Vec<String>, ClipboardError>;

    async fn write(&self, content: &str, mime_type: &str) -> Result<(), ClipboardError>;

    async fn clear(&self) -> Result<(), ClipboardError>;
}

/// `wl-paste` / `wl-copy` backed clipboard. Every invocation is bounded by
/// `timeout` and the child is killed if it overruns.
#[derive(Debug, Clone)]
pub struct WlClipboard {
    timeout: Duration,
}

impl WlClipboard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn capture(&self, tool: &'static str, args: &[&str]) -> Result<Vec<u8>, ClipboardError> {
        let child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClipboardError::Spawn { tool, source })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClipboardError::Timeout(tool))?
            .map_err(|source| ClipboardError::Spawn { tool, source })?;

        if !output.status.success() {
            return Err(ClipboardError::Status {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    // wl-copy forks a server process that keeps the selection alive, so
    // its stdout/stderr must not be piped or waiting would block on it.
    async fn feed(&self, args: &[&str], input: &[u8]) -> Result<(), ClipboardError> {
        let tool = WL_COPY;
        let mut child = Command::new(tool)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClipboardError::Spawn { tool, source })?;

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(child.wait().await?)
        };

        let status = timeout(self.timeout, run)
            .await
            .map_err(|_| ClipboardError::Timeout(tool))?
            .map_err(|source| ClipboardError::Spawn { tool, source })?;

        if !status.success() {
            return Err(ClipboardError::Status {
                tool,
                code: status.code(),
                stderr: String::new(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ClipboardBackend for WlClipboard {
    async fn read_text(&self) -> Result<String, ClipboardError> {
        let out = self.capture(WL_PASTE, &["--no-newline"]).await?;
        String::from_utf8(out).map_err(|_| ClipboardError::NotText)
    }

    async fn list_types(&self) -> Result<Vec<String>, ClipboardError> {
        let out = self.capture(WL_PASTE, &["--list-types"]).await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn write(&self, content: &str, mime_type: &str) -> Result<(), ClipboardError> {
        self.feed(&["--type", mime_type], content.as_bytes()).await
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.feed(&["--clear"], &[]).await
    }
}

/// In-process clipboard. Holds one value and its offered MIME types, and
/// records every write so callers can assert on them.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    text: Option<String>,
    types: Vec<String>,
    writes: Vec<(String, String)>,
    unavailable: bool,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a copy made by another application.
    pub fn set(&self, text: &str, types: &[&str]) {
        let mut state = self.state.lock();
        state.text = Some(text.to_string());
        state.types = types.iter().map(|t| t.to_string()).collect();
    }

    /// Makes every call fail as if the clipboard tools were missing.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn current(&self) -> Option<String> {
        self.state.lock().text.clone()
    }

    /// `(content, mime_type)` pairs written through the backend, oldest first.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.state.lock().writes.clone()
    }

    fn check(&self) -> Result<(), ClipboardError> {
        if self.state.lock().unavailable {
            return Err(ClipboardError::Spawn {
                tool: WL_PASTE,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClipboardBackend for MemoryClipboard {
    async fn read_text(&self) -> Result<String, ClipboardError> {
        self.check()?;
        self.state.lock().text.clone().ok_or(ClipboardError::Status {
            tool: WL_PASTE,
            code: Some(1),
            stderr: "Nothing is copied".to_string(),
        })
    }

    async fn list_types(&self) -> Result<Vec<String>, ClipboardError> {
        self.check()?;
        Ok(self.state.lock().types.clone())
    }

    async fn write(&self, content: &str, mime_type: &str) -> Result<(), ClipboardError> {
        self.check()?;
        let mut state = self.state.lock();
        state.text = Some(content.to_string());
        state.types = vec![mime_type.to_string()];
        state
            .writes
            .push((content.to_string(), mime_type.to_string()));
        Ok(())
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.check()?;
        let mut state = self.state.lock();
        state.text = None;
        state.types.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_clipboard_records_writes() {
        let clipboard = MemoryClipboard::new();
        clipboard.write("hello", MIME_TEXT).await.unwrap();

        assert_eq!(clipboard.read_text().await.unwrap(), "hello");
        assert_eq!(clipboard.list_types().await.unwrap(), vec![MIME_TEXT]);
        assert_eq!(
            clipboard.writes(),
            vec![("hello".to_string(), MIME_TEXT.to_string())]
        );
    }

    #[tokio::test]
    async fn empty_memory_clipboard_fails_like_wl_paste() {
        let clipboard = MemoryClipboard::new();
        assert!(matches!(
            clipboard.read_text().await,
            Err(ClipboardError::Status { .. })
        ));
    }

    #[tokio::test]
    async fn missing_tool_is_a_spawn_error() {
        let clipboard = WlClipboard {
            timeout: Duration::from_secs(1),
        };
        let err = clipboard
            .capture("clipstack-no-such-tool", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClipboardError::Spawn { .. }));
    }
}
