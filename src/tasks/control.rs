//! Local control channel: newline-delimited JSON over a Unix socket.
//!
//! ```text
//! {"command":"add-slide","id":7,"url":"https://…/7.zip","duration":10,"timestamp":1700000000}
//! {"command":"remove-slide","id":7}
//! {"command":"subscribe"}
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SlideError;
use crate::events::CurrentSlideChanged;
use crate::manager::SlideLifecycleManager;
use crate::slide::{SlideId, SlideMetadata};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    AddSlide(SlideMetadata),
    UpdateSlide(SlideMetadata),
    RemoveSlide { id: SlideId },
    Next,
    Previous,
    Stop,
    Start,
    Status,
    Subscribe,
}

pub async fn run(
    socket_path: PathBuf,
    manager: SlideLifecycleManager,
    cancel: CancellationToken,
) -> Result<()> {
    prepare_socket(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "control socket listening");

    let mut connections = JoinSet::new();
    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; closing control socket");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let manager = manager.clone();
                    let cancel = cancel.child_token();
                    connections.spawn(async move {
                        if let Err(err) = serve(stream, manager, cancel).await {
                            debug!(error = %err, "control connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept control connection"),
            },

            Some(_) = connections.join_next() => {}
        }
    }

    connections.abort_all();
    if let Err(err) = std::fs::remove_file(&socket_path) {
        debug!(path = %socket_path.display(), error = %err, "failed to remove control socket");
    }
    Ok(())
}

fn prepare_socket(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        }
    }
    if path.exists() {
        warn!(path = %path.display(), "removing stale control socket");
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

async fn serve(stream: UnixStream, manager: SlideLifecycleManager, cancel: CancellationToken) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "rejecting malformed control request");
                let reply = json!({"ok": false, "error": format!("invalid request: {err}")});
                write_line(&mut write, &reply).await?;
                continue;
            }
        };
        debug!(?request, "control request");
        if matches!(request, ControlRequest::Subscribe) {
            let events = manager.subscribe();
            write_line(&mut write, &json!({"ok": true})).await?;
            return stream_events(&mut write, events, &cancel).await;
        }
        let reply = match handle(&manager, request).await {
            Ok(Some(status)) => json!({"ok": true, "status": status}),
            Ok(None) => json!({"ok": true}),
            Err(err) => json!({"ok": false, "error": err.to_string()}),
        };
        write_line(&mut write, &reply).await?;
    }
    Ok(())
}

async fn handle(manager: &SlideLifecycleManager, request: ControlRequest) -> Result<Option<Value>, SlideError> {
    match request {
        ControlRequest::AddSlide(meta) => manager.add_slide(meta).await?,
        ControlRequest::UpdateSlide(meta) => manager.update_slide(meta).await?,
        ControlRequest::RemoveSlide { id } => manager.remove_slide(&id).await?,
        ControlRequest::Next => manager.next().await?,
        ControlRequest::Previous => manager.previous().await?,
        ControlRequest::Stop => manager.stop().await?,
        ControlRequest::Start => manager.start().await?,
        ControlRequest::Status => {
            let status = manager.status().await?;
            return Ok(serde_json::to_value(status).ok());
        }
        ControlRequest::Subscribe => {}
    }
    Ok(None)
}

async fn stream_events<W: AsyncWrite + Unpin>(
    write: &mut W,
    mut events: broadcast::Receiver<CurrentSlideChanged>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let event = select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(changed) => {
                let line = json!({"event": "current-slide-changed", "id": changed.0});
                write_line(write, &line).await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagging, events dropped");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(write: &mut W, value: &Value) -> Result<()> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    write.write_all(&buf).await?;
    write.flush().await?;
    Ok(())
}
