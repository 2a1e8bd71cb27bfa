//! Operator command socket.
//!
//! A Unix socket carrying newline-delimited JSON: one [`Command`] per line in,
//! one [`CommandReply`] per line out. Holding the bound socket doubles as the
//! single-instance lock. The OS drops the listener when the process dies, and
//! a leftover socket file nobody answers on is treated as stale.

use crate::config::DeviceUpdate;
use crate::error::{BridgeError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Operator-triggered actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Send the current position of a device (first device by default).
    SendNow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    /// Force a delivery with fixed or default test coordinates.
    TestPost {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lat: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lon: Option<f64>,
    },
    /// Edit a stored device record and reload all watchers.
    UpdateDevice {
        index: usize,
        #[serde(default)]
        fields: DeviceUpdate,
    },
    /// Rebuild all watchers from the stored records.
    Reload,
    /// List devices and watcher state.
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    Ok { message: String },
    Error { message: String },
}

impl CommandReply {
    pub fn ok(message: impl Into<String>) -> Self {
        CommandReply::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandReply::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CommandReply::Ok { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            CommandReply::Ok { message } | CommandReply::Error { message } => message,
        }
    }
}

/// A command received on the socket, waiting for its reply.
pub struct ControlRequest {
    pub command: Command,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Bound control socket. The socket file is removed on drop.
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind the socket at `path`.
    ///
    /// Fails with [`BridgeError::AlreadyRunning`] when another process is
    /// answering on it. Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(BridgeError::AlreadyRunning);
            }
            debug!("[Control] Removing stale socket {:?}", path);
            let _ = std::fs::remove_file(path);
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        match UnixListener::bind(path) {
            Ok(listener) => {
                info!("[Control] Listening on {:?}", path);
                Ok(Self {
                    listener,
                    path: path.to_path_buf(),
                })
            }
            // Another instance bound between our check and bind
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(BridgeError::AlreadyRunning),
            Err(e) => Err(e.into()),
        }
    }

    /// Accept connections until the returned task is aborted, forwarding
    /// every parsed command to `tx`.
    pub fn serve(self, tx: mpsc::Sender<ControlRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, tx.clone()));
                    }
                    Err(e) => {
                        warn!("[Control] Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<ControlRequest>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("[Control] Connection read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => dispatch(command, &tx).await,
            Err(e) => {
                warn!("[Control] Invalid command {:?}: {}", line, e);
                CommandReply::error(format!("invalid command: {}", e))
            }
        };

        if let Err(e) = write_json_line(&mut writer, &reply).await {
            debug!("[Control] Failed to write reply: {}", e);
            break;
        }
    }
}

async fn dispatch(command: Command, tx: &mpsc::Sender<ControlRequest>) -> CommandReply {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = ControlRequest {
        command,
        reply: reply_tx,
    };
    if tx.send(request).await.is_err() {
        return CommandReply::error("bridge is shutting down");
    }
    reply_rx
        .await
        .unwrap_or_else(|_| CommandReply::error("bridge is shutting down"))
}

async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut data = serde_json::to_vec(value)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Send one command to a running bridge and wait for the reply.
pub async fn send_command(path: &Path, command: &Command) -> Result<CommandReply> {
    let stream = UnixStream::connect(path).await?;
    let (reader, mut writer) = stream.into_split();
    write_json_line(&mut writer, command).await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(BridgeError::ControlProtocol(
            "connection closed before reply".to_string(),
        )),
    }
}
