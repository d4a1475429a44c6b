//! Unix socket server for tool calls

use crate::protocol::{Response, ToolCall};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub struct SocketServer {
    path: PathBuf,
    listener: UnixListener,
    broadcast_tx: broadcast::Sender<String>,
}

impl SocketServer {
    pub async fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        let (broadcast_tx, _) = broadcast::channel(100);
        info!("Socket server listening on {:?}", path);
        Ok(Self { path: path.to_path_buf(), listener, broadcast_tx })
    }

    /// Sender for lines pushed to every connected client.
    pub fn broadcast_sender(&self) -> broadcast::Sender<String> {
        self.broadcast_tx.clone()
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn socket_path() -> PathBuf {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{}/sysdoctor.sock", uid))
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn encode(response: &Response) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(json) => Some(json + "\n"),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            None
        }
    }
}

/// Serves newline-delimited JSON tool calls on one connection, one
/// response line per request, interleaved with broadcast lines.
pub async fn handle_client<H>(
    stream: UnixStream,
    mut broadcast_rx: broadcast::Receiver<String>,
    handler: Arc<H>,
) where
    H: RequestHandler + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    // next_line keeps a partial line buffered if a broadcast wins the select
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(None) => break,
                    Ok(Some(line)) => {
                        let response = match serde_json::from_str::<ToolCall>(&line) {
                            Ok(call) => handler.handle(call).await,
                            Err(e) => {
                                warn!("Invalid request: {}", e);
                                Response::error(None, e)
                            }
                        };
                        let Some(json) = encode(&response) else { continue };
                        if let Err(e) = writer.write_all(json.as_bytes()).await {
                            error!("Failed to write response: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break;
                    }
                }
            }
            result = broadcast_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if let Err(e) = writer.write_all((msg + "\n").as_bytes()).await {
                            error!("Failed to broadcast: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Client lagged, dropped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[async_trait::async_trait]
pub trait RequestHandler {
    async fn handle(&self, call: ToolCall) -> Response;
}

#[async_trait::async_trait]
impl RequestHandler for crate::bridge::QueryBridge {
    async fn handle(&self, call: ToolCall) -> Response {
        self.dispatch(call).await
    }
}
