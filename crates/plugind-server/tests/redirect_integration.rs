//! Two-node cluster, plugin owned by node 1: ten requests to node 0 each
//! return "ok" and cause exactly ten hits on node 1.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use plugind_cluster::{ClusterNode, InMemoryLedger};
use plugind_invocation::{ChunkStream, Dispatcher, Encryptor, HostApi, StorageOps};
use plugind_manager::PluginManager;
use plugind_metadata::InMemoryMetadataStore;
use plugind_server::{router, AppState};
use plugind_types::{DaemonError, PluginUniqueIdentifier};
use serde_json::Value;

struct UnusedHostApi;
#[async_trait]
impl HostApi for UnusedHostApi {
    async fn invoke_stream(&self, _kind: plugind_proto::InvokeKind, _request: Value) -> Result<ChunkStream, DaemonError> {
        unreachable!()
    }
    async fn invoke_unary(&self, _kind: plugind_proto::InvokeKind, _request: Value) -> Result<Value, DaemonError> {
        unreachable!()
    }
}
struct PassthroughEncryptor;
#[async_trait]
impl Encryptor for PassthroughEncryptor {
    async fn encrypt(&self, _tenant_id: &str, request: &Value) -> Result<Value, DaemonError> {
        Ok(request.clone())
    }
}
struct UnusedStorageOps;
#[async_trait]
impl StorageOps for UnusedStorageOps {
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

#[tokio::test]
async fn ten_requests_to_node_zero_redirect_to_node_one_exactly_ten_times() {
    let identifier = PluginUniqueIdentifier::parse(
        "acme/widget:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
    )
    .unwrap();

    let listener0 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port0 = listener0.local_addr().unwrap().port();
    let port1 = listener1.local_addr().unwrap().port();

    let ledger = Arc::new(InMemoryLedger::new());
    let node0 = ClusterNode::new("127.0.0.1", port0, ledger.clone());
    let node1 = ClusterNode::new("127.0.0.1", port1, ledger.clone());

    // node 1 owns the plugin; publishing via mark_plugin_launched makes it
    // visible to node 0 through the shared ledger immediately.
    node1.mark_plugin_launched(identifier.clone()).await;

    let dispatcher =
        Arc::new(Dispatcher::new(Arc::new(UnusedHostApi), Arc::new(PassthroughEncryptor), Arc::new(UnusedStorageOps)));
    let metadata = InMemoryMetadataStore::new();
    let manager = PluginManager::new(Arc::new(plugind_storage::MemoryObjectStore::default()), metadata.clone(), dispatcher);

    let state0 = Arc::new(AppState { manager, cluster: node0, metadata, http_client: reqwest::Client::new() });
    let app0 = router(state0);
    tokio::spawn(async move {
        axum::serve(listener0, app0).await.unwrap();
    });

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_route = hits.clone();
    let app1 = Router::new().route(
        "/plugin/invoke/tool",
        get(move || {
            let hits = hits_for_route.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener1, app1).await.unwrap();
    });

    // let node 1's server start accepting before hammering node 0.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    for _ in 0..10 {
        let response = client
            .get(format!("http://127.0.0.1:{port0}/plugin/invoke/tool"))
            .header("plugin-identifier", identifier.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    assert_eq!(hits.load(Ordering::SeqCst), 10);
}
