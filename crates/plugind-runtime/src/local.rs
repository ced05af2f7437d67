use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use plugind_proto::{decode_line, encode_session};
use plugind_session::{BroadcastReceiver, Broadcaster};
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::ops::{PluginRuntimeOps, RuntimeKind, SessionMessage};

const MEMORY_LIMIT_HARD_CEILING: u64 = 512 * 1024 * 1024;
const CPU_SECONDS_LIMIT: u64 = 3600;
const FD_LIMIT: u64 = 256;

/// Prepares a plugin package's working directory (installs a language
/// runtime's dependencies) before the process is first started. Modeled as
/// a narrow trait since the real bootstrapper is out of scope.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, declaration: &PluginDeclaration, package_dir: &Path) -> Result<(), DaemonError>;
}

/// An installer that does nothing; used when a package directory is already
/// prepared (e.g. pre-built containers).
pub struct NoopInstaller;

#[async_trait]
impl Installer for NoopInstaller {
    async fn install(&self, _declaration: &PluginDeclaration, _package_dir: &Path) -> Result<(), DaemonError> {
        Ok(())
    }
}

/// A subprocess-backed runtime: inbound is the child's stdin, outbound is
/// its stdout parsed by the framed-stream codec.
pub struct LocalRuntime {
    identifier: PluginUniqueIdentifier,
    declaration: PluginDeclaration,
    package_dir: PathBuf,
    entrypoint: PathBuf,
    installer: Arc<dyn Installer>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    broadcaster: Arc<Broadcaster<SessionMessage>>,
    stopped: AtomicBool,
    restarts: AtomicU32,
    exited: Arc<Notify>,
}

impl LocalRuntime {
    pub fn new(
        declaration: PluginDeclaration,
        package_dir: PathBuf,
        installer: Arc<dyn Installer>,
    ) -> Result<Self, DaemonError> {
        let identifier = declaration.identifier.clone();
        validate_path_component(&identifier.plugin_id())?;
        let entrypoint = package_dir.join(&declaration.runner.entrypoint);
        Ok(Self {
            identifier,
            declaration,
            package_dir,
            entrypoint,
            installer,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            broadcaster: Arc::new(Broadcaster::new(256)),
            stopped: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            exited: Arc::new(Notify::new()),
        })
    }
}

/// Rejects identifiers that could escape a path or shell-metacharacter
/// position; the daemon builds no shell command from plugin input, but a
/// hostile identifier must never reach `Command::new`/path joins unchecked.
fn validate_path_component(value: &str) -> Result<(), DaemonError> {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if safe && !value.contains("..") {
        Ok(())
    } else {
        Err(DaemonError::BadRequest(format!("unsafe plugin identifier: {value}")))
    }
}

fn apply_resource_limits() -> std::io::Result<()> {
    setrlimit(Resource::RLIMIT_AS, MEMORY_LIMIT_HARD_CEILING, MEMORY_LIMIT_HARD_CEILING)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    setrlimit(Resource::RLIMIT_CPU, CPU_SECONDS_LIMIT, CPU_SECONDS_LIMIT)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    setrlimit(Resource::RLIMIT_NOFILE, FD_LIMIT, FD_LIMIT)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

#[async_trait]
impl PluginRuntimeOps for LocalRuntime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identifier
    }

    fn configuration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn init_environment(&self) -> Result<(), DaemonError> {
        self.installer.install(&self.declaration, &self.package_dir).await
    }

    async fn start_plugin(&self) -> Result<(), DaemonError> {
        let mut cmd = Command::new(&self.entrypoint);
        cmd.current_dir(&self.package_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(apply_resource_limits);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DaemonError::UpstreamUnavailable(format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::Internal("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::Internal("child stdout not piped".into()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let broadcaster = self.broadcaster.clone();
        let exited = self.exited.clone();
        let identifier = self.identifier.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let mut session_event = None;
                        let mut error_event = None;
                        let mut log_event = None;
                        decode_line(
                            &line,
                            |session_id, data| session_event = Some((session_id.to_string(), data.clone())),
                            || {},
                            |message| error_event = Some(message.to_string()),
                            |message| log_event = Some(message.to_string()),
                        );

                        if let Some((session_id, data)) = session_event {
                            if let Ok(session_id) = Uuid::parse_str(&session_id) {
                                let bytes = data.to_string().into_bytes();
                                broadcaster
                                    .send(SessionMessage { session_id, data: bytes.into() })
                                    .await;
                            }
                        }
                        if let Some(message) = error_event {
                            tracing::warn!(plugin = %identifier, %message, "plugin reported error");
                        }
                        if let Some(message) = log_event {
                            tracing::info!(plugin = %identifier, %message, "plugin log");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(plugin = %identifier, error = %e, "reading plugin stdout failed");
                        break;
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

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| DaemonError::UpstreamUnavailable("plugin process not running".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaemonError::UpstreamUnavailable(e.to_string()))
    }

    async fn listen(&self) -> BroadcastReceiver<SessionMessage> {
        self.broadcaster.subscribe().await
    }

    async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        self.stopped.store(true, Ordering::SeqCst);
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
        let _ = tokio::fs::remove_dir_all(&self.package_dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_in_identifier() {
        assert!(validate_path_component("acme/widget").is_ok());
        assert!(validate_path_component("../../etc/passwd").is_err());
        assert!(validate_path_component("acme; rm -rf /").is_err());
    }
}
