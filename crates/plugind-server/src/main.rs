use std::path::PathBuf;
use std::sync::Arc;

use plugind_cluster::{ClusterNode, InMemoryLedger};
use plugind_config::DaemonConfig;
use plugind_invocation::Dispatcher;
use plugind_manager::{LaunchConfig, PluginManager};
use plugind_metadata::InMemoryMetadataStore;
use plugind_server::{router, AppState};
use plugind_storage::FsObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = DaemonConfig::load(&PathBuf::from("plugind.toml"))?;
    tracing::info!(bind_address = %config.bind_address, "starting plugind");

    let ledger = Arc::new(InMemoryLedger::new());
    let cluster = ClusterNode::new(
        config.bind_address.ip().to_string(),
        config.bind_address.port(),
        ledger,
    );
    let _heartbeat = cluster.spawn_heartbeat();
    let _election = cluster.spawn_election();

    let blob_store = Arc::new(FsObjectStore::new(config.installed_blob_dir.clone()));
    let metadata = InMemoryMetadataStore::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(no_op_host_api()),
        Arc::new(no_op_encryptor()),
        Arc::new(no_op_storage_ops()),
    ));
    let manager = PluginManager::new(blob_store, metadata.clone(), dispatcher);
    manager
        .launch(LaunchConfig { package_root: config.package_dir.clone(), debug_port_range: config.debug_port_range })
        .await?;

    let state = Arc::new(AppState { manager, cluster, metadata, http_client: reqwest::Client::new() });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Placeholder collaborators until a real host-application client (out of
/// scope) is wired in. Every call returns `UpstreamUnavailable`.
fn no_op_host_api() -> impl plugind_invocation::HostApi {
    struct NoOpHostApi;
    #[async_trait::async_trait]
    impl plugind_invocation::HostApi for NoOpHostApi {
        async fn invoke_stream(
            &self,
            _kind: plugind_proto::InvokeKind,
            _request: serde_json::Value,
        ) -> Result<plugind_invocation::ChunkStream, plugind_types::DaemonError> {
            Err(plugind_types::DaemonError::UpstreamUnavailable("host api not configured".into()))
        }
        async fn invoke_unary(
            &self,
            _kind: plugind_proto::InvokeKind,
            _request: serde_json::Value,
        ) -> Result<serde_json::Value, plugind_types::DaemonError> {
            Err(plugind_types::DaemonError::UpstreamUnavailable("host api not configured".into()))
        }
    }
    NoOpHostApi
}

fn no_op_encryptor() -> impl plugind_invocation::Encryptor {
    struct NoOpEncryptor;
    #[async_trait::async_trait]
    impl plugind_invocation::Encryptor for NoOpEncryptor {
        async fn encrypt(
            &self,
            _tenant_id: &str,
            request: &serde_json::Value,
        ) -> Result<serde_json::Value, plugind_types::DaemonError> {
            Ok(request.clone())
        }
    }
    NoOpEncryptor
}

fn no_op_storage_ops() -> impl plugind_invocation::StorageOps {
    struct NoOpStorageOps;
    #[async_trait::async_trait]
    impl plugind_invocation::StorageOps for NoOpStorageOps {
        async fn get(&self, _tenant_id: &str, _plugin_id: &str, _key: &str) -> Result<Vec<u8>, plugind_types::DaemonError> {
            Err(plugind_types::DaemonError::NotFound("storage not configured".into()))
        }
        async fn set(&self, _tenant_id: &str, _plugin_id: &str, _key: &str, _value: Vec<u8>) -> Result<(), plugind_types::DaemonError> {
            Err(plugind_types::DaemonError::UpstreamUnavailable("storage not configured".into()))
        }
        async fn del(&self, _tenant_id: &str, _plugin_id: &str, _key: &str) -> Result<(), plugind_types::DaemonError> {
            Err(plugind_types::DaemonError::UpstreamUnavailable("storage not configured".into()))
        }
    }
    NoOpStorageOps
}
