use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use plugind_session::{BroadcastReceiver, Broadcaster};
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::ops::{PluginRuntimeOps, RuntimeKind, SessionMessage};

/// Bound on a single serverless invocation.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(240);

/// Each `Write` is an independent HTTPS POST to `${lambda_url}/invoke`; the
/// response body is a line-delimited event stream parsed by the framed
/// codec and fanned out to listeners of the session named in the header.
pub struct ServerlessRuntime {
    identifier: PluginUniqueIdentifier,
    declaration: PluginDeclaration,
    lambda_url: String,
    client: reqwest::Client,
    broadcaster: Arc<Broadcaster<SessionMessage>>,
    stopped: AtomicBool,
    restarts: AtomicU32,
    exited: Arc<Notify>,
}

impl ServerlessRuntime {
    pub fn new(declaration: PluginDeclaration, lambda_url: String, client: reqwest::Client) -> Self {
        Self {
            identifier: declaration.identifier.clone(),
            declaration,
            lambda_url,
            client,
            broadcaster: Arc::new(Broadcaster::new(256)),
            stopped: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            exited: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl PluginRuntimeOps for ServerlessRuntime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identifier
    }

    fn configuration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Serverless
    }

    async fn init_environment(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn start_plugin(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn wait(&self) {
        self.exited.notified().await;
    }

    async fn write(&self, session_id: Uuid, data: &[u8]) -> Result<(), DaemonError> {
        let url = format!("{}/invoke", self.lambda_url.trim_end_matches('/'));
        let body: serde_json::Value = serde_json::from_slice(data)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(data).into_owned()));

        let response = tokio::time::timeout(
            WRITE_DEADLINE,
            self.client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream")
                .header("Plugin-Session-ID", session_id.to_string())
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| DaemonError::Timeout(format!("serverless invoke for session {session_id} exceeded 240s")))?
        .map_err(|e| DaemonError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DaemonError::UpstreamUnavailable(format!(
                "serverless endpoint returned {}",
                response.status()
            )));
        }

        let broadcaster = self.broadcaster.clone();
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| DaemonError::UpstreamUnavailable(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].to_string();
                buffer.drain(..=pos);
                if line.trim().is_empty() {
                    continue;
                }
                let mut session_event = None;
                plugind_proto::decode_line(
                    &line,
                    |sid, data| session_event = Some((sid.to_string(), data.clone())),
                    || {},
                    |message| tracing::warn!(%message, "serverless plugin reported error"),
                    |message| tracing::info!(%message, "serverless plugin log"),
                );
                if let Some((sid, data)) = session_event {
                    if let Ok(sid) = Uuid::parse_str(&sid) {
                        broadcaster
                            .send(SessionMessage { session_id: sid, data: data.to_string().into_bytes().into() })
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn listen(&self) -> BroadcastReceiver<SessionMessage> {
        self.broadcaster.subscribe().await
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.exited.notify_waiters();
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn trigger_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.exited.notify_waiters();
    }

    fn add_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup(&self) {
        self.broadcaster.close().await;
    }
}
