use std::sync::Arc;

use async_trait::async_trait;
use plugind_session::BroadcastReceiver;
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use uuid::Uuid;

/// Which of the three transport shapes a runtime instance uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Local,
    Remote,
    Serverless,
}

/// One chunk of framed output a runtime produced for a given session,
/// fanned out to whoever is listening via [`PluginRuntimeOps::listen`].
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session_id: Uuid,
    pub data: Arc<[u8]>,
}

/// Common capability set shared by the local/remote/serverless runtime
/// variants. The lifetime supervisor and the plugin manager drive plugins
/// exclusively through this trait, never through the concrete variant types.
#[async_trait]
pub trait PluginRuntimeOps: Send + Sync {
    fn identity(&self) -> &PluginUniqueIdentifier;
    fn configuration(&self) -> &PluginDeclaration;
    fn kind(&self) -> RuntimeKind;

    /// Prepares resources; may take minutes. Retried by the lifetime
    /// supervisor with a bounded failure count before it gives up.
    async fn init_environment(&self) -> Result<(), DaemonError>;

    /// Transitions to running; returns once the plugin has signaled
    /// readiness or an I/O error occurred.
    async fn start_plugin(&self) -> Result<(), DaemonError>;

    /// Resolves once the plugin process/connection has exited. Fires at
    /// most once per `start_plugin` cycle.
    async fn wait(&self);

    /// Pushes a framed request to the plugin for `session_id`.
    async fn write(&self, session_id: Uuid, data: &[u8]) -> Result<(), DaemonError>;

    /// Subscribes to inbound frames addressed to `session_id`.
    async fn listen(&self) -> BroadcastReceiver<SessionMessage>;

    async fn stop(&self);
    fn stopped(&self) -> bool;
    fn trigger_stop(&self);
    fn add_restarts(&self);
    async fn cleanup(&self);
}
