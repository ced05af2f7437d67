//! Static permission gate mapping each backwards-invocation kind to the
//! manifest flag that must be set before a plugin may use it.

use plugind_proto::InvokeKind;
use plugind_types::PluginDeclaration;

#[derive(Debug, thiserror::Error)]
#[error("permission denied, you need to enable {0} access in plugin manifest")]
pub struct PermissionDenied(pub &'static str);

/// Checks whether `declaration`'s permission matrix grants `kind`.
///
/// `upload_file` is always allowed, matching the upstream host-API
/// behavior: any plugin may stage a file it already produced.
pub fn check_permission(
    declaration: &PluginDeclaration,
    kind: InvokeKind,
) -> Result<(), PermissionDenied> {
    let permission = &declaration.permission;
    let (allowed, label) = match kind {
        InvokeKind::Tool => (permission.tool_enabled, "tool"),
        InvokeKind::Llm => (permission.model.enabled && permission.model.llm, "llm"),
        InvokeKind::TextEmbedding => (
            permission.model.enabled && permission.model.text_embedding,
            "text-embedding",
        ),
        InvokeKind::Rerank => (
            permission.model.enabled && permission.model.rerank,
            "rerank",
        ),
        InvokeKind::Tts => (permission.model.enabled && permission.model.tts, "tts"),
        InvokeKind::Speech2Text => (
            permission.model.enabled && permission.model.speech2text,
            "speech2text",
        ),
        InvokeKind::Moderation => (
            permission.model.enabled && permission.model.moderation,
            "moderation",
        ),
        InvokeKind::NodeParameterExtractor | InvokeKind::NodeQuestionClassifier => {
            (permission.node_enabled, "node")
        }
        InvokeKind::App => (permission.app_enabled, "app"),
        InvokeKind::Storage => (permission.storage.enabled, "storage"),
        InvokeKind::Encrypt => (permission.storage.enabled, "storage"),
        InvokeKind::SystemSummary => (
            permission.model.enabled && permission.model.llm,
            "llm",
        ),
        InvokeKind::UploadFile => (true, "upload_file"),
    };

    if allowed {
        Ok(())
    } else {
        Err(PermissionDenied(label))
    }
}
