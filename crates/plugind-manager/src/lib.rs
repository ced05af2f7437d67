//! Keyed plugin runtime registry plus install-to-local streaming and
//! process-wide launch, with a periodic-info/terminal-event rhythm on the
//! install stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugind_invocation::Dispatcher;
use plugind_metadata::MetadataStore;
use plugind_runtime::{
    run_lifetime, Installer, LocalRuntime, NoopInstaller, PluginRuntimeOps, RegisterFn, RemoteRuntime, ServerlessRuntime,
};
use plugind_storage::ObjectStore;
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};

const INSTALL_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const INSTALL_DEADLINE: Duration = Duration::from_secs(240);

/// What a plugin sends as the first line on a freshly accepted debug-port
/// connection, identifying itself before the daemon builds a runtime for it.
#[derive(serde::Deserialize)]
struct DebugHandshake {
    declaration: PluginDeclaration,
}

/// One event on the `InstallToLocal` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    Info(String),
    Done(String),
    Error(String),
}

/// Told about every runtime that transitions to "launched" or "stopped", so
/// the cluster coordinator can keep its ownership ledger in sync without
/// the manager depending on `plugind-cluster` directly.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    async fn on_launched(&self, identifier: &PluginUniqueIdentifier);
    async fn on_stopped(&self, identifier: &PluginUniqueIdentifier);
}

/// Parameters for [`PluginManager::launch`].
pub struct LaunchConfig {
    pub package_root: PathBuf,
    /// Inclusive range to bind the debug-port listener on; the first free
    /// port in the range is used.
    pub debug_port_range: (u16, u16),
}

pub struct PluginManager {
    runtimes: RwLock<HashMap<PluginUniqueIdentifier, Arc<dyn PluginRuntimeOps>>>,
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
    blob_store: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    dispatcher: Arc<Dispatcher>,
    http_client: reqwest::Client,
}

impl PluginManager {
    pub fn new(
        blob_store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtimes: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            blob_store,
            metadata,
            dispatcher,
            http_client: reqwest::Client::new(),
        })
    }

    pub async fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.write().await.push(observer);
    }

    pub async fn get(&self, identifier: &PluginUniqueIdentifier) -> Result<Arc<dyn PluginRuntimeOps>, DaemonError> {
        self.runtimes
            .read()
            .await
            .get(identifier)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("plugin {identifier}")))
    }

    /// The singleton host-API client plugins dispatch backwards-invocations
    /// through.
    pub fn backwards_invocation(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    async fn notify_launched(&self, identifier: &PluginUniqueIdentifier) {
        for observer in self.observers.read().await.iter() {
            observer.on_launched(identifier).await;
        }
    }

    async fn notify_stopped(&self, identifier: &PluginUniqueIdentifier) {
        for observer in self.observers.read().await.iter() {
            observer.on_stopped(identifier).await;
        }
    }

    fn register_fn(self: &Arc<Self>) -> RegisterFn {
        let manager = Arc::clone(self);
        Box::new(move |runtime: Arc<dyn PluginRuntimeOps>| {
            let identifier = runtime.identity().clone();
            let mut guard = manager
                .runtimes
                .try_write()
                .map_err(|_| DaemonError::Internal("plugin registry lock contended during register".into()))?;
            if guard.contains_key(&identifier) {
                return Err(DaemonError::BadRequest(format!("plugin {identifier} is already registered")));
            }
            guard.insert(identifier, runtime);
            Ok(())
        })
    }

    /// Saves `source` to the installed-blob bucket, spawns a local runtime
    /// under the lifetime supervisor, and streams `info`/`done`/`error`
    /// events until the runtime reports launched, fails, or the 240s
    /// deadline passes.
    pub async fn install_to_local(
        self: &Arc<Self>,
        declaration: PluginDeclaration,
        package_dir: PathBuf,
        source: Vec<u8>,
    ) -> plugind_session::BoundedStreamReader<InstallEvent> {
        let (writer, reader) = plugind_session::bounded_stream::<InstallEvent>(8);
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let identifier = declaration.identifier.clone();

            if let Err(e) = manager.blob_store.put(&identifier.to_string(), source).await {
                writer.write(InstallEvent::Error(e.to_string())).await;
                writer.close();
                return;
            }

            let runtime: Arc<dyn PluginRuntimeOps> = match LocalRuntime::new(
                declaration,
                package_dir,
                Arc::new(NoopInstaller) as Arc<dyn Installer>,
            ) {
                Ok(runtime) => Arc::new(runtime),
                Err(e) => {
                    writer.write(InstallEvent::Error(e.to_string())).await;
                    writer.close();
                    return;
                }
            };

            let (launched_tx, mut launched_rx) = oneshot::channel();
            let (err_tx, mut err_rx) = oneshot::channel();
            let registers = vec![manager.register_fn()];

            let supervised = runtime.clone();
            let lifetime_handle =
                tokio::spawn(async move { run_lifetime(supervised, &registers, Some(launched_tx), Some(err_tx)).await });

            let mut progress = tokio::time::interval(INSTALL_PROGRESS_INTERVAL);
            progress.tick().await; // first tick fires immediately; skip it.
            let deadline = tokio::time::sleep(INSTALL_DEADLINE);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut launched_rx => {
                        if let Ok(err) = err_rx.try_recv() {
                            writer.write(InstallEvent::Error(err.to_string())).await;
                        } else {
                            manager.notify_launched(&identifier).await;
                            writer.write(InstallEvent::Done("Installed".into())).await;
                        }
                        break;
                    }
                    _ = progress.tick() => {
                        writer.write(InstallEvent::Info("Installing".into())).await;
                    }
                    _ = &mut deadline => {
                        writer.write(InstallEvent::Info("Timeout".into())).await;
                        runtime.stop().await;
                        break;
                    }
                }
            }

            writer.close();
            let _ = lifetime_handle.await;
            manager.notify_stopped(&identifier).await;
        });

        reader
    }

    /// Rebuilds runtimes for every installed local package, every
    /// serverless runtime row, and starts accepting new remote debug
    /// connections, all on process startup.
    pub async fn launch(self: &Arc<Self>, config: LaunchConfig) -> Result<(), DaemonError> {
        for row in self.metadata.list_all_installations().await? {
            let identifier = row.identifier.clone();
            let package_dir = config.package_root.join(identifier.to_string());
            let runtime: Arc<dyn PluginRuntimeOps> =
                match LocalRuntime::new(row.declaration, package_dir, Arc::new(NoopInstaller) as Arc<dyn Installer>) {
                    Ok(runtime) => Arc::new(runtime),
                    Err(e) => {
                        tracing::warn!(plugin = %identifier, error = %e, "failed to rebuild local runtime on startup");
                        continue;
                    }
                };
            self.spawn_supervised_runtime(runtime);
        }

        for row in self.metadata.list_serverless_runtimes().await? {
            let runtime: Arc<dyn PluginRuntimeOps> =
                Arc::new(ServerlessRuntime::new(row.declaration, row.lambda_url, self.http_client.clone()));
            let identifier = runtime.identity().clone();
            self.runtimes.write().await.insert(identifier.clone(), runtime.clone());
            self.notify_launched(&identifier).await;
        }

        let listener = Self::bind_debug_listener(config.debug_port_range).await?;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (socket, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "debug port accept failed");
                        continue;
                    }
                };
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.accept_debug_connection(socket, addr).await;
                });
            }
        });

        Ok(())
    }

    /// Runs `runtime` through the full register/init/start lifecycle in the
    /// background, notifying observers once it reaches "launched" and again
    /// once its supervising task exits.
    fn spawn_supervised_runtime(self: &Arc<Self>, runtime: Arc<dyn PluginRuntimeOps>) {
        let identifier = runtime.identity().clone();
        let registers = vec![self.register_fn()];
        let (launched_tx, launched_rx) = oneshot::channel();

        let manager = Arc::clone(self);
        let stopped_identifier = identifier.clone();
        tokio::spawn(async move {
            run_lifetime(runtime, &registers, Some(launched_tx), None).await;
            manager.notify_stopped(&stopped_identifier).await;
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if launched_rx.await.is_ok() {
                manager.notify_launched(&identifier).await;
            }
        });
    }

    /// Binds the first free port in `port_range`, inclusive.
    async fn bind_debug_listener(port_range: (u16, u16)) -> Result<TcpListener, DaemonError> {
        let (low, high) = port_range;
        for port in low..=high {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok(listener);
            }
        }
        Err(DaemonError::Internal(format!("no free debug port in {low}-{high}")))
    }

    /// Reads the handshake line off a freshly accepted debug connection,
    /// then builds and supervises a [`RemoteRuntime`] for it.
    async fn accept_debug_connection(self: &Arc<Self>, mut socket: TcpStream, addr: SocketAddr) {
        let mut line = String::new();
        {
            let mut reader = tokio::io::BufReader::new(&mut socket);
            if let Err(e) = reader.read_line(&mut line).await {
                tracing::warn!(%addr, error = %e, "debug connection handshake read failed");
                return;
            }
        }

        let handshake: DebugHandshake = match serde_json::from_str(line.trim()) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "malformed debug connection handshake");
                return;
            }
        };

        let runtime: Arc<dyn PluginRuntimeOps> = Arc::new(RemoteRuntime::new(handshake.declaration, socket));
        self.spawn_supervised_runtime(runtime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plugind_invocation::{Encryptor, HostApi, StorageOps};
    use plugind_metadata::InMemoryMetadataStore;
    use plugind_storage::MemoryObjectStore;
    use plugind_types::{Architecture, PluginCategory, RunnerHints};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NullHostApi;
    #[async_trait]
    impl HostApi for NullHostApi {
        async fn invoke_stream(
            &self,
            _kind: plugind_proto::InvokeKind,
            _request: Value,
        ) -> Result<plugind_invocation::ChunkStream, DaemonError> {
            unreachable!()
        }
        async fn invoke_unary(&self, _kind: plugind_proto::InvokeKind, _request: Value) -> Result<Value, DaemonError> {
            unreachable!()
        }
    }
    struct NullEncryptor;
    #[async_trait]
    impl Encryptor for NullEncryptor {
        async fn encrypt(&self, _tenant_id: &str, request: &Value) -> Result<Value, DaemonError> {
            Ok(request.clone())
        }
    }
    struct NullStorage;
    #[async_trait]
    impl StorageOps for NullStorage {
        async fn get(&self, _t: &str, _p: &str, _k: &str) -> Result<Vec<u8>, DaemonError> {
            unreachable!()
        }
        async fn set(&self, _t: &str, _p: &str, _k: &str, _v: Vec<u8>) -> Result<(), DaemonError> {
            unreachable!()
        }
        async fn del(&self, _t: &str, _p: &str, _k: &str) -> Result<(), DaemonError> {
            unreachable!()
        }
    }

    struct RecordingObserver {
        launched: Mutex<Vec<PluginUniqueIdentifier>>,
        stopped_count: AtomicUsize,
    }

    #[async_trait]
    impl LifecycleObserver for RecordingObserver {
        async fn on_launched(&self, identifier: &PluginUniqueIdentifier) {
            self.launched.lock().unwrap().push(identifier.clone());
        }
        async fn on_stopped(&self, _identifier: &PluginUniqueIdentifier) {
            self.stopped_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn declaration(entrypoint: &str) -> PluginDeclaration {
        PluginDeclaration {
            identifier: PluginUniqueIdentifier::parse(
                "acme/widget:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
            )
            .unwrap(),
            category: PluginCategory::Tool,
            memory_limit_bytes: 1024,
            runner: RunnerHints { language: "python".into(), version: "3.12".into(), entrypoint: entrypoint.into() },
            permission: Default::default(),
            supported_architectures: vec![Architecture::current()],
        }
    }

    fn manager() -> Arc<PluginManager> {
        let dispatcher =
            Arc::new(Dispatcher::new(Arc::new(NullHostApi), Arc::new(NullEncryptor), Arc::new(NullStorage)));
        PluginManager::new(Arc::new(MemoryObjectStore::default()), InMemoryMetadataStore::new(), dispatcher)
    }

    #[tokio::test]
    async fn get_missing_plugin_is_not_found() {
        let manager = manager();
        let id = declaration("run.py").identifier;
        assert!(matches!(manager.get(&id).await, Err(DaemonError::NotFound(_))));
    }

    #[tokio::test]
    async fn launch_registers_serverless_runtimes_from_metadata() {
        let dispatcher =
            Arc::new(Dispatcher::new(Arc::new(NullHostApi), Arc::new(NullEncryptor), Arc::new(NullStorage)));
        let metadata = InMemoryMetadataStore::new();
        let decl = declaration("run.py");
        metadata
            .put_serverless_runtime(plugind_metadata::ServerlessRuntimeRow {
                identifier: decl.identifier.clone(),
                lambda_url: "https://example.invalid".into(),
                declaration: decl.clone(),
            })
            .await
            .unwrap();

        let manager = PluginManager::new(Arc::new(MemoryObjectStore::default()), metadata, dispatcher);
        let observer = Arc::new(RecordingObserver { launched: Mutex::new(Vec::new()), stopped_count: AtomicUsize::new(0) });
        manager.add_observer(observer.clone()).await;

        manager
            .launch(LaunchConfig { package_root: PathBuf::from("/tmp"), debug_port_range: (0, 0) })
            .await
            .unwrap();

        assert!(manager.get(&decl.identifier).await.is_ok());
        assert_eq!(observer.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn launch_rebuilds_local_runtimes_from_installations() {
        let dispatcher =
            Arc::new(Dispatcher::new(Arc::new(NullHostApi), Arc::new(NullEncryptor), Arc::new(NullStorage)));
        let metadata = InMemoryMetadataStore::new();
        let decl = declaration("run.py");
        metadata
            .put_installation(plugind_metadata::PluginInstallationRow {
                tenant_id: "acme".into(),
                identifier: decl.identifier.clone(),
                declaration: decl.clone(),
                installed_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let manager = PluginManager::new(Arc::new(MemoryObjectStore::default()), metadata, dispatcher);
        let observer = Arc::new(RecordingObserver { launched: Mutex::new(Vec::new()), stopped_count: AtomicUsize::new(0) });
        manager.add_observer(observer.clone()).await;

        manager
            .launch(LaunchConfig { package_root: PathBuf::from("/tmp"), debug_port_range: (0, 0) })
            .await
            .unwrap();

        // the background register/init task needs a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.get(&decl.identifier).await.is_ok());
        assert_eq!(observer.launched.lock().unwrap().len(), 1);
    }
}
