use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugind_proto::{decode_line, encode_session};
use plugind_session::{BroadcastReceiver, Broadcaster};
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::ops::{PluginRuntimeOps, RuntimeKind, SessionMessage};

/// If no `heartbeat` event arrives within this window, the connection is
/// considered dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// A plugin connected inbound to the daemon's debug port; the daemon is the
/// server role on an otherwise ordinary framed-stream socket.
pub struct RemoteRuntime {
    identifier: PluginUniqueIdentifier,
    declaration: PluginDeclaration,
    writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    broadcaster: Arc<Broadcaster<SessionMessage>>,
    stopped: AtomicBool,
    restarts: AtomicU32,
    exited: Arc<Notify>,
    accepted: Mutex<Option<TcpStream>>,
}

impl RemoteRuntime {
    pub fn new(declaration: PluginDeclaration, socket: TcpStream) -> Self {
        Self {
            identifier: declaration.identifier.clone(),
            declaration,
            writer: Mutex::new(None),
            broadcaster: Arc::new(Broadcaster::new(256)),
            stopped: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            exited: Arc::new(Notify::new()),
            accepted: Mutex::new(Some(socket)),
        }
    }
}

#[async_trait]
impl PluginRuntimeOps for RemoteRuntime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identifier
    }

    fn configuration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Remote
    }

    async fn init_environment(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn start_plugin(&self) -> Result<(), DaemonError> {
        let socket = self
            .accepted
            .lock()
            .await
            .take()
            .ok_or_else(|| DaemonError::Internal("remote runtime already started".into()))?;
        let (read_half, write_half) = socket.into_split();
        *self.writer.lock().await = Some(write_half);

        let broadcaster = self.broadcaster.clone();
        let exited = self.exited.clone();
        let identifier = self.identifier.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let line = tokio::time::timeout(HEARTBEAT_TIMEOUT, lines.next_line()).await;
                let line = match line {
                    Ok(Ok(Some(l))) => l,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        tracing::warn!(plugin = %identifier, error = %e, "remote plugin socket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(plugin = %identifier, "no heartbeat within timeout, closing connection");
                        break;
                    }
                };

                let mut session_event = None;
                decode_line(
                    &line,
                    |session_id, data| session_event = Some((session_id.to_string(), data.clone())),
                    || {},
                    |message| tracing::warn!(plugin = %identifier, %message, "plugin reported error"),
                    |message| tracing::info!(plugin = %identifier, %message, "plugin log"),
                );

                if let Some((session_id, data)) = session_event {
                    if let Ok(session_id) = Uuid::parse_str(&session_id) {
                        broadcaster
                            .send(SessionMessage { session_id, data: data.to_string().into_bytes().into() })
                            .await;
                    }
                }
            }
            exited.notify_waiters();
        });

        Ok(())
    }

    async fn wait(&self) {
        self.exited.notified().await;
    }

    async fn write(&self, session_id: Uuid, data: &[u8]) -> Result<(), DaemonError> {
        let value = serde_json::from_slice(data)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(data).into_owned()));
        let mut line = encode_session(&session_id.to_string(), &value);
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| DaemonError::UpstreamUnavailable("remote plugin not connected".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaemonError::UpstreamUnavailable(e.to_string()))
    }

    async fn listen(&self) -> BroadcastReceiver<SessionMessage> {
        self.broadcaster.subscribe().await
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        *self.writer.lock().await = None;
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn trigger_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn add_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup(&self) {
        self.broadcaster.close().await;
    }
}
