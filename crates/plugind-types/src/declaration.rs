use serde::{Deserialize, Serialize};

use crate::identifier::PluginUniqueIdentifier;

/// Category a plugin's primary capability falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    Tool,
    Model,
    Endpoint,
    AgentStrategy,
}

/// CPU architectures a plugin's local-variant binary may declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Architecture of the host the daemon is currently running on.
    pub fn current() -> Self {
        if cfg!(target_arch = "aarch64") {
            Architecture::Arm64
        } else {
            Architecture::Amd64
        }
    }
}

/// Runner hints describing how a local-variant plugin is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHints {
    pub language: String,
    pub version: String,
    pub entrypoint: String,
}

/// Which backwards-invocation model capabilities a plugin may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPermission {
    pub enabled: bool,
    pub llm: bool,
    pub text_embedding: bool,
    pub rerank: bool,
    pub tts: bool,
    pub speech2text: bool,
    pub moderation: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePermission {
    pub enabled: bool,
    /// Quota in bytes; `-1` means unbounded.
    pub size: i64,
}

/// Nested permission flags gating every backwards-invocation kind, per the
/// daemon's permission matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMatrix {
    #[serde(default)]
    pub tool_enabled: bool,
    #[serde(default)]
    pub model: ModelPermission,
    #[serde(default)]
    pub node_enabled: bool,
    #[serde(default)]
    pub app_enabled: bool,
    #[serde(default)]
    pub storage: StoragePermission,
    #[serde(default)]
    pub endpoint_enabled: bool,
}

/// Immutable, per-identifier manifest describing one plugin build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDeclaration {
    pub identifier: PluginUniqueIdentifier,
    pub category: PluginCategory,
    /// Declared memory limit in bytes for the local-variant subprocess.
    pub memory_limit_bytes: u64,
    pub runner: RunnerHints,
    pub permission: PermissionMatrix,
    pub supported_architectures: Vec<Architecture>,
}

impl PluginDeclaration {
    pub fn supports_arch(&self, arch: Architecture) -> bool {
        self.supported_architectures.contains(&arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_permission_matrix_denies_everything() {
        let m = PermissionMatrix::default();
        assert!(!m.tool_enabled);
        assert!(!m.model.enabled);
        assert!(!m.storage.enabled);
    }

    #[test]
    fn supports_arch_checks_membership() {
        let decl = PluginDeclaration {
            identifier: PluginUniqueIdentifier::parse(
                "a/b:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
            )
            .unwrap(),
            category: PluginCategory::Tool,
            memory_limit_bytes: 1,
            runner: RunnerHints {
                language: "python".into(),
                version: "3.12".into(),
                entrypoint: "main.py".into(),
            },
            permission: PermissionMatrix::default(),
            supported_architectures: vec![Architecture::Amd64],
        };
        assert!(decl.supports_arch(Architecture::Amd64));
        assert!(!decl.supports_arch(Architecture::Arm64));
    }
}
