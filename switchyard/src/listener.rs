//! The trigger socket.
//!
//! Clients connect, write a handful of request bytes (see
//! [`switchyard_qmgr::Trigger`]) and hang up. Each connection becomes one
//! batch on the scheduler's trigger channel.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use switchyard_common::{Signal, internal};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{broadcast, mpsc},
};

/// Where the socket lives, relative to the queue directory.
pub const SOCKET_NAME: &str = "public/qmgr";

/// Longest request read from one connection; the rest is dropped.
const MAX_REQUEST: usize = 100;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[must_use]
pub fn socket_path(queue_directory: &Path) -> PathBuf {
    queue_directory.join(SOCKET_NAME)
}

#[derive(Debug)]
pub struct TriggerListener {
    path: PathBuf,
    listener: UnixListener,
}

impl TriggerListener {
    /// Bind the socket, replacing a stale one left by a process that died.
    ///
    /// # Errors
    ///
    /// When another process is already listening, or the socket cannot be
    /// created.
    pub async fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("trigger socket already in use: {}", path.display()),
                ));
            }
            internal!(level = INFO, path = %path.display(), "removing stale trigger socket");
            tokio::fs::remove_file(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&path)?;
        // Anyone may post a trigger; only the owner may read.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o622)).await?;
        internal!(level = INFO, path = %path.display(), "trigger socket listening");

        Ok(Self { path, listener })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward requests to `triggers` until shutdown, then remove the socket.
    pub async fn serve(
        self,
        triggers: mpsc::Sender<Vec<u8>>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let triggers = triggers.clone();
                        tokio::spawn(async move {
                            match read_request(stream).await {
                                Ok(bytes) if bytes.is_empty() => {}
                                Ok(bytes) => {
                                    if triggers.send(bytes).await.is_err() {
                                        internal!(level = DEBUG, "scheduler gone, dropping trigger");
                                    }
                                }
                                Err(err) => {
                                    internal!(level = WARN, error = %err, "cannot read trigger request");
                                }
                            }
                        });
                    }
                    Err(err) => internal!(level = ERROR, error = %err, "cannot accept trigger connection"),
                },
                sig = shutdown.recv() => {
                    if let Err(err) = sig {
                        internal!(level = ERROR, error = %err, "shutdown channel error");
                    }
                    break;
                }
            }
        }

        if let Err(err) = tokio::fs::remove_file(&self.path).await
            && err.kind() != io::ErrorKind::NotFound
        {
            internal!(level = WARN, path = %self.path.display(), error = %err, "cannot remove trigger socket");
        }
        Ok(())
    }
}

async fn read_request(stream: UnixStream) -> io::Result<Vec<u8>> {
    let mut request = Vec::with_capacity(8);
    tokio::time::timeout(
        READ_TIMEOUT,
        stream.take(MAX_REQUEST as u64).read_to_end(&mut request),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "trigger client did not finish"))??;
    Ok(request)
}

/// Write `request` to the trigger socket at `path`.
///
/// # Errors
///
/// When nothing is listening at `path`.
pub async fn send_trigger(path: &Path, request: &[u8]) -> io::Result<()> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(request).await?;
    stream.shutdown().await
}
