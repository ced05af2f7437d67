//! Backwards-invocation dispatcher: turns a framed request a
//! plugin sent upstream into one or more response envelopes, enriching the
//! request with session context and gating it by the permission matrix.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use plugind_proto::{BackwardsInvocationRequest, BackwardsInvocationResponse, InvokeKind};
use plugind_types::{DaemonError, PermissionMatrix, PluginAccessType, PluginDeclaration};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invoke request is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invoke request is empty")]
    Empty,
}

/// Re-frames a response envelope back onto the plugin's inbound pipe.
#[async_trait]
pub trait BackwardsInvocationWriter: Send + Sync {
    async fn write(&self, response: BackwardsInvocationResponse);
}

pub type ChunkStream = std::pin::Pin<Box<dyn futures_core::Stream<Item = Result<Value, String>> + Send>>;

/// Outbound calls a dispatched invocation makes into the rest of the
/// platform: the streaming/unary host API, the encryption service, and the
/// per-plugin persistence bucket. Kept as trait objects so the dispatcher
/// has no dependency on `plugind-manager`/`plugind-storage` directly.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn invoke_stream(&self, kind: InvokeKind, request: Value) -> Result<ChunkStream, DaemonError>;
    async fn invoke_unary(&self, kind: InvokeKind, request: Value) -> Result<Value, DaemonError>;
}

#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, tenant_id: &str, request: &Value) -> Result<Value, DaemonError>;
}

#[async_trait]
pub trait StorageOps: Send + Sync {
    async fn get(&self, tenant_id: &str, plugin_id: &str, key: &str) -> Result<Vec<u8>, DaemonError>;
    async fn set(&self, tenant_id: &str, plugin_id: &str, key: &str, value: Vec<u8>) -> Result<(), DaemonError>;
    async fn del(&self, tenant_id: &str, plugin_id: &str, key: &str) -> Result<(), DaemonError>;
}

pub struct Dispatcher {
    pub host_api: Arc<dyn HostApi>,
    pub encryptor: Arc<dyn Encryptor>,
    pub storage: Arc<dyn StorageOps>,
}

const STREAMING_KINDS: [InvokeKind; 4] = [
    InvokeKind::Llm,
    InvokeKind::Tts,
    InvokeKind::Tool,
    InvokeKind::App,
];

/// True when `request`'s config contains no `secret-input` typed field —
/// in that case encryption is a short-circuited no-op.
fn needs_encryption(request: &Value) -> bool {
    request
        .get("config")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .any(|f| f.get("type").and_then(Value::as_str) == Some("secret-input"))
        })
        .unwrap_or(false)
}

impl Dispatcher {
    pub fn new(host_api: Arc<dyn HostApi>, encryptor: Arc<dyn Encryptor>, storage: Arc<dyn StorageOps>) -> Self {
        Self { host_api, encryptor, storage }
    }

    /// Parses, gates, and dispatches one backwards-invocation payload.
    /// Returns an error only when the payload itself is malformed; every
    /// other fault is surfaced to the plugin as an `error` envelope.
    pub async fn dispatch(
        self: &Arc<Self>,
        declaration: Arc<PluginDeclaration>,
        access_type: PluginAccessType,
        tenant_id: String,
        user_id: String,
        plugin_id: String,
        writer: Arc<dyn BackwardsInvocationWriter>,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        let envelope: BackwardsInvocationRequest = serde_json::from_slice(payload)?;
        let request_id = envelope.backwards_request_id;
        let kind = envelope.kind;

        if access_type.is_model() {
            writer
                .write(BackwardsInvocationResponse::error(
                    request_id,
                    format!("you can not invoke backwards from {access_type:?}"),
                ))
                .await;
            writer.write(BackwardsInvocationResponse::end(request_id)).await;
            return Ok(());
        }

        if let Err(denied) = plugind_security::check_permission(&declaration, kind) {
            writer
                .write(BackwardsInvocationResponse::error(request_id, denied.to_string()))
                .await;
            writer.write(BackwardsInvocationResponse::end(request_id)).await;
            return Ok(());
        }

        let enriched = enrich(envelope.request, &tenant_id, &user_id, kind);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .run(kind, request_id, plugin_id, tenant_id, enriched, writer)
                .await;
        });

        Ok(())
    }

    async fn run(
        &self,
        kind: InvokeKind,
        request_id: Uuid,
        plugin_id: String,
        tenant_id: String,
        request: Value,
        writer: Arc<dyn BackwardsInvocationWriter>,
    ) {
        if STREAMING_KINDS.contains(&kind) {
            self.run_streaming(kind, request_id, request, &writer).await;
        } else if kind == InvokeKind::Encrypt {
            self.run_encrypt(request_id, &tenant_id, request, &writer).await;
        } else if kind == InvokeKind::Storage {
            self.run_storage(request_id, &tenant_id, &plugin_id, request, &writer).await;
        } else {
            self.run_unary(kind, request_id, request, &writer).await;
        }
        writer.write(BackwardsInvocationResponse::end(request_id)).await;
    }

    async fn run_streaming(
        &self,
        kind: InvokeKind,
        request_id: Uuid,
        request: Value,
        writer: &Arc<dyn BackwardsInvocationWriter>,
    ) {
        match self.host_api.invoke_stream(kind, request).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(value) => {
                            writer
                                .write(BackwardsInvocationResponse::stream(request_id, value))
                                .await
                        }
                        Err(message) => {
                            writer
                                .write(BackwardsInvocationResponse::error(request_id, message))
                                .await
                        }
                    }
                }
            }
            Err(err) => {
                writer
                    .write(BackwardsInvocationResponse::error(request_id, err.to_string()))
                    .await
            }
        }
    }

    async fn run_unary(
        &self,
        kind: InvokeKind,
        request_id: Uuid,
        request: Value,
        writer: &Arc<dyn BackwardsInvocationWriter>,
    ) {
        match self.host_api.invoke_unary(kind, request).await {
            Ok(value) => {
                writer
                    .write(BackwardsInvocationResponse::unary(request_id, value))
                    .await
            }
            Err(err) => {
                writer
                    .write(BackwardsInvocationResponse::error(request_id, err.to_string()))
                    .await
            }
        }
    }

    async fn run_encrypt(
        &self,
        request_id: Uuid,
        tenant_id: &str,
        request: Value,
        writer: &Arc<dyn BackwardsInvocationWriter>,
    ) {
        if !needs_encryption(&request) {
            writer
                .write(BackwardsInvocationResponse::unary(
                    request_id,
                    request.get("data").cloned().unwrap_or(Value::Null),
                ))
                .await;
            return;
        }
        match self.encryptor.encrypt(tenant_id, &request).await {
            Ok(value) => {
                writer
                    .write(BackwardsInvocationResponse::unary(request_id, value))
                    .await
            }
            Err(err) => {
                writer
                    .write(BackwardsInvocationResponse::error(request_id, err.to_string()))
                    .await
            }
        }
    }

    async fn run_storage(
        &self,
        request_id: Uuid,
        tenant_id: &str,
        plugin_id: &str,
        request: Value,
        writer: &Arc<dyn BackwardsInvocationWriter>,
    ) {
        let action = request.get("action").and_then(Value::as_str).unwrap_or("");
        let key = request.get("key").and_then(Value::as_str).unwrap_or("");

        let result = match action {
            "get" => self
                .storage
                .get(tenant_id, plugin_id, key)
                .await
                .map(|bytes| json!({ "data": hex::encode(bytes) })),
            "set" => {
                let value = request.get("value").and_then(Value::as_str).unwrap_or("");
                let bytes = match hex::decode(value) {
                    Ok(b) => b,
                    Err(e) => {
                        writer
                            .write(BackwardsInvocationResponse::error(request_id, e.to_string()))
                            .await;
                        return;
                    }
                };
                self.storage
                    .set(tenant_id, plugin_id, key, bytes)
                    .await
                    .map(|_| json!({ "data": "ok" }))
            }
            "del" => self
                .storage
                .del(tenant_id, plugin_id, key)
                .await
                .map(|_| json!({ "data": "ok" })),
            other => Err(DaemonError::BadRequest(format!("unknown storage action: {other}"))),
        };

        match result {
            Ok(value) => writer.write(BackwardsInvocationResponse::unary(request_id, value)).await,
            Err(err) => writer.write(BackwardsInvocationResponse::error(request_id, err.to_string())).await,
        }
    }
}

fn enrich(mut request: Value, tenant_id: &str, user_id: &str, kind: InvokeKind) -> Value {
    if let Value::Object(map) = &mut request {
        map.insert("tenant_id".into(), json!(tenant_id));
        map.insert("user_id".into(), json!(user_id));
        map.insert("type".into(), json!(kind));
    }
    request
}

/// Allows a permission matrix to be constructed in dispatcher-facing tests
/// without pulling in every `plugind-types` field by name.
pub fn full_access_matrix() -> PermissionMatrix {
    PermissionMatrix {
        tool_enabled: true,
        model: plugind_types::ModelPermission {
            enabled: true,
            llm: true,
            text_embedding: true,
            rerank: true,
            tts: true,
            speech2text: true,
            moderation: true,
        },
        node_enabled: true,
        app_enabled: true,
        storage: plugind_types::StoragePermission { enabled: true, size: -1 },
        endpoint_enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugind_types::{Architecture, PluginCategory, PluginUniqueIdentifier, RunnerHints};
    use std::sync::Mutex as StdMutex;

    struct RecordingWriter {
        responses: StdMutex<Vec<BackwardsInvocationResponse>>,
    }

    impl RecordingWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self { responses: StdMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl BackwardsInvocationWriter for RecordingWriter {
        async fn write(&self, response: BackwardsInvocationResponse) {
            self.responses.lock().unwrap().push(response);
        }
    }

    struct EchoHostApi;

    #[async_trait]
    impl HostApi for EchoHostApi {
        async fn invoke_stream(&self, _kind: InvokeKind, _request: Value) -> Result<ChunkStream, DaemonError> {
            let items = vec![Ok(json!({"chunk": 1})), Ok(json!({"chunk": 2}))];
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        async fn invoke_unary(&self, _kind: InvokeKind, request: Value) -> Result<Value, DaemonError> {
            Ok(request)
        }
    }

    struct NullEncryptor;

    #[async_trait]
    impl Encryptor for NullEncryptor {
        async fn encrypt(&self, _tenant_id: &str, request: &Value) -> Result<Value, DaemonError> {
            Ok(request.clone())
        }
    }

    struct InMemoryStorage {
        data: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl InMemoryStorage {
        fn new() -> Arc<Self> {
            Arc::new(Self { data: tokio::sync::Mutex::new(std::collections::HashMap::new()) })
        }
    }

    #[async_trait]
    impl StorageOps for InMemoryStorage {
        async fn get(&self, _tenant_id: &str, _plugin_id: &str, key: &str) -> Result<Vec<u8>, DaemonError> {
            self.data
                .lock()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| DaemonError::NotFound(key.to_string()))
        }

        async fn set(&self, _tenant_id: &str, _plugin_id: &str, key: &str, value: Vec<u8>) -> Result<(), DaemonError> {
            self.data.lock().await.insert(key.to_string(), value);
            Ok(())
        }

        async fn del(&self, _tenant_id: &str, _plugin_id: &str, key: &str) -> Result<(), DaemonError> {
            self.data.lock().await.remove(key);
            Ok(())
        }
    }

    fn declaration(permission: PermissionMatrix) -> Arc<PluginDeclaration> {
        Arc::new(PluginDeclaration {
            identifier: PluginUniqueIdentifier::parse(
                "acme/widget:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
            )
            .unwrap(),
            category: PluginCategory::Tool,
            memory_limit_bytes: 1,
            runner: RunnerHints { language: "python".into(), version: "3.12".into(), entrypoint: "main.py".into() },
            permission,
            supported_architectures: vec![Architecture::Amd64],
        })
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Arc::new(EchoHostApi), Arc::new(NullEncryptor), InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn model_access_type_is_rejected() {
        let d = dispatcher();
        let writer = RecordingWriter::new();
        let req_id = Uuid::new_v4();
        let payload = json!({"type": "tool", "backwards_request_id": req_id, "request": {}}).to_string();

        d.dispatch(
            declaration(full_access_matrix()),
            PluginAccessType::Model,
            "t".into(),
            "u".into(),
            "p".into(),
            writer.clone(),
            payload.as_bytes(),
        )
        .await
        .unwrap();

        let responses = writer.responses.lock().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].kind, plugind_proto::ResponseKind::Error);
        assert_eq!(responses[1].kind, plugind_proto::ResponseKind::End);
    }

    #[tokio::test]
    async fn permission_denied_emits_error_then_end() {
        let d = dispatcher();
        let writer = RecordingWriter::new();
        let req_id = Uuid::new_v4();
        let payload = json!({"type": "tool", "backwards_request_id": req_id, "request": {}}).to_string();

        d.dispatch(
            declaration(PermissionMatrix::default()),
            PluginAccessType::Tool,
            "t".into(),
            "u".into(),
            "p".into(),
            writer.clone(),
            payload.as_bytes(),
        )
        .await
        .unwrap();

        let responses = writer.responses.lock().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].kind, plugind_proto::ResponseKind::Error);
    }

    #[tokio::test]
    async fn streaming_kind_emits_chunks_then_end() {
        let d = dispatcher();
        let writer = RecordingWriter::new();
        let req_id = Uuid::new_v4();
        let payload = json!({"type": "tool", "backwards_request_id": req_id, "request": {}}).to_string();

        d.dispatch(
            declaration(full_access_matrix()),
            PluginAccessType::Tool,
            "t".into(),
            "u".into(),
            "p".into(),
            writer.clone(),
            payload.as_bytes(),
        )
        .await
        .unwrap();

        // dispatch spawns the worker; give it a turn to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let responses = writer.responses.lock().unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].kind, plugind_proto::ResponseKind::Stream);
        assert_eq!(responses[1].kind, plugind_proto::ResponseKind::Stream);
        assert_eq!(responses[2].kind, plugind_proto::ResponseKind::End);
    }

    #[tokio::test]
    async fn storage_set_then_get_round_trips_hex() {
        let d = dispatcher();
        let writer = RecordingWriter::new();

        let set_id = Uuid::new_v4();
        let set_payload = json!({
            "type": "storage",
            "backwards_request_id": set_id,
            "request": {"action": "set", "key": "k", "value": hex::encode("hello")},
        })
        .to_string();
        d.dispatch(
            declaration(full_access_matrix()),
            PluginAccessType::Tool,
            "t".into(),
            "u".into(),
            "p".into(),
            writer.clone(),
            set_payload.as_bytes(),
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let get_id = Uuid::new_v4();
        let get_payload = json!({
            "type": "storage",
            "backwards_request_id": get_id,
            "request": {"action": "get", "key": "k"},
        })
        .to_string();
        d.dispatch(
            declaration(full_access_matrix()),
            PluginAccessType::Tool,
            "t".into(),
            "u".into(),
            "p".into(),
            writer.clone(),
            get_payload.as_bytes(),
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let responses = writer.responses.lock().unwrap();
        assert_eq!(responses[0].response, json!({"data": "ok"}));
        assert_eq!(responses[2].response, json!({"data": hex::encode("hello")}));
    }
}
