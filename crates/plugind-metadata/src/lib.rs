//! Relational metadata store boundary: `plugin`,
//! `plugin_installation`, `endpoint`, `serverless_runtime`, `install_task`,
//! `tenant_storage` rows. The schema is opaque to the rest of the daemon —
//! only row presence and unique-key semantics matter — so this crate
//! exposes a trait plus an in-memory implementation sufficient for tests.
//! A production deployment swaps in a real `sqlx` pool behind the same
//! trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plugind_types::{DaemonError, PluginDeclaration, PluginUniqueIdentifier};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PluginInstallationRow {
    pub tenant_id: String,
    pub identifier: PluginUniqueIdentifier,
    pub declaration: PluginDeclaration,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EndpointRow {
    pub hook_id: String,
    pub tenant_id: String,
    pub identifier: PluginUniqueIdentifier,
    pub path_prefix: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ServerlessRuntimeRow {
    pub identifier: PluginUniqueIdentifier,
    pub lambda_url: String,
    pub declaration: PluginDeclaration,
}

/// CRUD boundary over the rows the daemon needs. Every method is scoped by
/// tenant where the row type carries one.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_installation(&self, row: PluginInstallationRow) -> Result<(), DaemonError>;
    async fn get_installation(
        &self,
        tenant_id: &str,
        identifier: &PluginUniqueIdentifier,
    ) -> Result<PluginInstallationRow, DaemonError>;
    async fn list_installations(&self, tenant_id: &str) -> Result<Vec<PluginInstallationRow>, DaemonError>;
    /// Every installation row across every tenant, used to rebuild local
    /// runtimes on startup.
    async fn list_all_installations(&self) -> Result<Vec<PluginInstallationRow>, DaemonError>;
    async fn delete_installation(
        &self,
        tenant_id: &str,
        identifier: &PluginUniqueIdentifier,
    ) -> Result<(), DaemonError>;

    async fn put_endpoint(&self, row: EndpointRow) -> Result<(), DaemonError>;
    async fn get_endpoint(&self, hook_id: &str) -> Result<EndpointRow, DaemonError>;
    async fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<EndpointRow>, DaemonError>;

    async fn put_serverless_runtime(&self, row: ServerlessRuntimeRow) -> Result<(), DaemonError>;
    async fn list_serverless_runtimes(&self) -> Result<Vec<ServerlessRuntimeRow>, DaemonError>;
}

#[derive(Default)]
struct Tables {
    installations: HashMap<(String, PluginUniqueIdentifier), PluginInstallationRow>,
    endpoints: HashMap<String, EndpointRow>,
    serverless_runtimes: HashMap<PluginUniqueIdentifier, ServerlessRuntimeRow>,
}

/// In-process implementation backing tests and single-node deployments
/// without a real database.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put_installation(&self, row: PluginInstallationRow) -> Result<(), DaemonError> {
        let key = (row.tenant_id.clone(), row.identifier.clone());
        self.tables.write().await.installations.insert(key, row);
        Ok(())
    }

    async fn get_installation(
        &self,
        tenant_id: &str,
        identifier: &PluginUniqueIdentifier,
    ) -> Result<PluginInstallationRow, DaemonError> {
        self.tables
            .read()
            .await
            .installations
            .get(&(tenant_id.to_string(), identifier.clone()))
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("installation {identifier} for tenant {tenant_id}")))
    }

    async fn list_installations(&self, tenant_id: &str) -> Result<Vec<PluginInstallationRow>, DaemonError> {
        Ok(self
            .tables
            .read()
            .await
            .installations
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_all_installations(&self) -> Result<Vec<PluginInstallationRow>, DaemonError> {
        Ok(self.tables.read().await.installations.values().cloned().collect())
    }

    async fn delete_installation(
        &self,
        tenant_id: &str,
        identifier: &PluginUniqueIdentifier,
    ) -> Result<(), DaemonError> {
        self.tables
            .write()
            .await
            .installations
            .remove(&(tenant_id.to_string(), identifier.clone()));
        Ok(())
    }

    async fn put_endpoint(&self, row: EndpointRow) -> Result<(), DaemonError> {
        self.tables.write().await.endpoints.insert(row.hook_id.clone(), row);
        Ok(())
    }

    async fn get_endpoint(&self, hook_id: &str) -> Result<EndpointRow, DaemonError> {
        self.tables
            .read()
            .await
            .endpoints
            .get(hook_id)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("endpoint {hook_id}")))
    }

    async fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<EndpointRow>, DaemonError> {
        Ok(self
            .tables
            .read()
            .await
            .endpoints
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn put_serverless_runtime(&self, row: ServerlessRuntimeRow) -> Result<(), DaemonError> {
        self.tables
            .write()
            .await
            .serverless_runtimes
            .insert(row.identifier.clone(), row);
        Ok(())
    }

    async fn list_serverless_runtimes(&self) -> Result<Vec<ServerlessRuntimeRow>, DaemonError> {
        Ok(self.tables.read().await.serverless_runtimes.values().cloned().collect())
    }
}
