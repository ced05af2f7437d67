use serde::{Deserialize, Serialize};

/// The kind of upstream caller a [`Session`](crate) was opened on behalf of.
///
/// Plugins acting as model providers (`Model`) are not permitted to initiate
/// backwards invocations themselves — see the dispatcher's rule 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginAccessType {
    Tool,
    Model,
    Endpoint,
    AgentStrategy,
    Webapp,
}

impl PluginAccessType {
    pub fn is_model(self) -> bool {
        matches!(self, PluginAccessType::Model)
    }
}
