use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every backwards-invocation kind a plugin may initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    Tool,
    Llm,
    TextEmbedding,
    Rerank,
    Tts,
    Speech2Text,
    Moderation,
    App,
    NodeParameterExtractor,
    NodeQuestionClassifier,
    Storage,
    Encrypt,
    SystemSummary,
    UploadFile,
}

impl InvokeKind {
    pub const ALL: [InvokeKind; 14] = [
        InvokeKind::Tool,
        InvokeKind::Llm,
        InvokeKind::TextEmbedding,
        InvokeKind::Rerank,
        InvokeKind::Tts,
        InvokeKind::Speech2Text,
        InvokeKind::Moderation,
        InvokeKind::App,
        InvokeKind::NodeParameterExtractor,
        InvokeKind::NodeQuestionClassifier,
        InvokeKind::Storage,
        InvokeKind::Encrypt,
        InvokeKind::SystemSummary,
        InvokeKind::UploadFile,
    ];

    /// Streaming kinds iterate the host-API stream and emit `stream`
    /// response envelopes; everything else replies with a single `struct`.
    pub fn is_streaming(self) -> bool {
        matches!(self, InvokeKind::Llm | InvokeKind::Tts | InvokeKind::Tool | InvokeKind::App)
    }
}

/// `{"type", "backwards_request_id", "request": {...}}` sent by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackwardsInvocationRequest {
    #[serde(rename = "type")]
    pub kind: InvokeKind,
    pub backwards_request_id: Uuid,
    pub request: serde_json::Value,
}

/// The shape of a single response line sent back to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Stream,
    Struct,
    Error,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackwardsInvocationResponse {
    pub backwards_response_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub response: serde_json::Value,
}

impl BackwardsInvocationResponse {
    pub fn stream(id: Uuid, chunk: serde_json::Value) -> Self {
        Self {
            backwards_response_id: id,
            kind: ResponseKind::Stream,
            response: chunk,
        }
    }

    pub fn unary(id: Uuid, value: serde_json::Value) -> Self {
        Self {
            backwards_response_id: id,
            kind: ResponseKind::Struct,
            response: value,
        }
    }

    pub fn error(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            backwards_response_id: id,
            kind: ResponseKind::Error,
            response: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn end(id: Uuid) -> Self {
        Self {
            backwards_response_id: id,
            kind: ResponseKind::End,
            response: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_envelope() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "type": "llm",
            "backwards_request_id": id,
            "request": {"prompt": "hi"},
        });
        let req: BackwardsInvocationRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.kind, InvokeKind::Llm);
        assert_eq!(req.backwards_request_id, id);
    }

    #[test]
    fn streaming_kinds_match_spec() {
        assert!(InvokeKind::Llm.is_streaming());
        assert!(InvokeKind::Tts.is_streaming());
        assert!(InvokeKind::Tool.is_streaming());
        assert!(InvokeKind::App.is_streaming());
        assert!(!InvokeKind::TextEmbedding.is_streaming());
        assert!(!InvokeKind::Storage.is_streaming());
    }

    #[test]
    fn upload_file_round_trips() {
        let json = serde_json::to_string(&InvokeKind::UploadFile).unwrap();
        assert_eq!(json, "\"upload_file\"");
    }
}
