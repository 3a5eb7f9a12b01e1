//! Single-instance guard. The first process owns a Unix socket; later
//! invocations connect to it, send `SHOW\n` and exit.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

pub const SHOW_COMMAND: &[u8] = b"SHOW\n";

const MAX_COMMAND_LEN: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub enum Role {
    /// This process is the running instance.
    Primary(InstanceSignal),
    /// Another instance was found and told to show itself.
    SecondaryExited,
}

pub struct InstanceSignal {
    listener: UnixListener,
    path: PathBuf,
}

/// Becomes the primary instance, or wakes the existing one. An existing
/// socket file is only removed once connecting to it has failed.
pub async fn acquire(path: &Path) -> Result<Role> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match UnixListener::bind(path) {
        Ok(listener) => return primary(listener, path),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to bind {}", path.display())),
    }

    if notify_running(path).await.is_ok() {
        info!("Another instance is running; asked it to show");
        return Ok(Role::SecondaryExited);
    }

    debug!("Removing stale socket {}", path.display());
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    }

    match UnixListener::bind(path) {
        Ok(listener) => primary(listener, path),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            notify_running(path)
                .await
                .context("Socket in use but no instance answered")?;
            Ok(Role::SecondaryExited)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to bind {}", path.display())),
    }
}

fn primary(listener: UnixListener, path: &Path) -> Result<Role> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    info!("Listening for show requests on {}", path.display());

    Ok(Role::Primary(InstanceSignal {
        listener,
        path: path.to_path_buf(),
    }))
}

/// Sends the show command to the instance listening at `path`.
pub async fn notify_running(path: &Path) -> Result<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .context("Connection timeout")?
        .context("Failed to connect to running instance")?;

    stream.write_all(SHOW_COMMAND).await?;
    stream.shutdown().await?;
    Ok(())
}

impl InstanceSignal {
    /// Accepts connections forever, one at a time, calling `on_show` for
    /// every well-formed show request.
    pub async fn serve<F>(self, on_show: F) -> Result<()>
    where
        F: Fn() + Send + Sync,
    {
        loop {
            let (stream, _addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            if read_command(stream).await {
                debug!("Show requested");
                on_show();
            }
        }
    }
}

impl Drop for InstanceSignal {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// Reads until a newline, EOF or the size cap; the client does not have to
// close its end first.
async fn read_command(mut stream: UnixStream) -> bool {
    let mut buf = [0u8; MAX_COMMAND_LEN];
    let mut filled = 0;

    let read = timeout(READ_TIMEOUT, async {
        while filled < buf.len() {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if buf[..filled].contains(&b'\n') {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    matches!(read, Ok(Ok(()))) && &buf[..filled] == SHOW_COMMAND
}
