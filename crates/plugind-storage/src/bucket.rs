use std::collections::HashMap;
use std::sync::Arc;

use plugind_types::DaemonError;
use tokio::sync::RwLock;

use crate::object_store::ObjectStore;

/// `-1` on a quota means unbounded, matching the manifest's
/// `StoragePermission::size` invariant.
const UNBOUNDED: i64 = -1;

fn namespaced_key(tenant_id: &str, plugin_id: &str, key: &str) -> String {
    format!("{tenant_id}/{plugin_id}/{key}")
}

/// Per-`(tenant_id, plugin_id)` namespace over an [`ObjectStore`], tracking
/// bytes used so `save` can enforce a quota atomically.
pub struct PersistenceBucket {
    store: Arc<dyn ObjectStore>,
    used: RwLock<HashMap<(String, String), u64>>,
}

impl PersistenceBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, used: RwLock::new(HashMap::new()) }
    }

    async fn used_bytes(&self, tenant_id: &str, plugin_id: &str) -> u64 {
        *self
            .used
            .read()
            .await
            .get(&(tenant_id.to_string(), plugin_id.to_string()))
            .unwrap_or(&0)
    }

    /// Writes `value` under `key`, rejecting with `QuotaExceeded` when
    /// `max_size >= 0` and the write would push total usage past it. The
    /// usage counter and the underlying write are updated atomically with
    /// respect to other callers of this bucket for the same namespace.
    pub async fn save(
        &self,
        tenant_id: &str,
        plugin_id: &str,
        max_size: i64,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), DaemonError> {
        let namespace = (tenant_id.to_string(), plugin_id.to_string());
        let mut used = self.used.write().await;
        let current = *used.get(&namespace).unwrap_or(&0);

        let previous_size = self
            .store
            .get(&namespaced_key(tenant_id, plugin_id, key))
            .await
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        let projected = current.saturating_sub(previous_size) + value.len() as u64;

        if max_size != UNBOUNDED && projected > max_size as u64 {
            return Err(DaemonError::QuotaExceeded { used: projected, quota: max_size as u64 });
        }

        self.store.put(&namespaced_key(tenant_id, plugin_id, key), value).await?;
        used.insert(namespace, projected);
        Ok(())
    }

    pub async fn load(&self, tenant_id: &str, plugin_id: &str, key: &str) -> Result<Vec<u8>, DaemonError> {
        self.store.get(&namespaced_key(tenant_id, plugin_id, key)).await
    }

    pub async fn delete(&self, tenant_id: &str, plugin_id: &str, key: &str) -> Result<(), DaemonError> {
        let namespace = (tenant_id.to_string(), plugin_id.to_string());
        let size = self
            .store
            .get(&namespaced_key(tenant_id, plugin_id, key))
            .await
            .map(|v| v.len() as u64)
            .unwrap_or(0);

        self.store.delete(&namespaced_key(tenant_id, plugin_id, key)).await?;

        let mut used = self.used.write().await;
        if let Some(current) = used.get_mut(&namespace) {
            *current = current.saturating_sub(size);
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn used_for_test(&self, tenant_id: &str, plugin_id: &str) -> u64 {
        self.used_bytes(tenant_id, plugin_id).await
    }
}
