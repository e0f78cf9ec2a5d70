use crate::provider_manager::ProviderRegistry;
use crate::settings::EngineSettings;
use crate::store::FleetStore;
use fleet_common::{ClusterInfo, EngineError, Instance};
use fleet_providers::CloudProvider;
use std::sync::Arc;

/// Capacity reconciliation engine. Cheap to share behind an `Arc`; every
/// operation is call-scoped apart from the registry's client cache.
///
/// Operations are spread over `provisioning` (expand), `termination`
/// (shrink), `reconciliation` (repair) and `queries`.
pub struct Engine {
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn FleetStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn FleetStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) async fn provider(
        &self,
        cluster: &ClusterInfo,
    ) -> Result<Arc<dyn CloudProvider>, EngineError> {
        self.registry.get_or_create(cluster).await
    }

    /// Writes `pending` rows for freshly created ids.
    pub async fn record_instances(
        &self,
        cluster: &ClusterInfo,
        task_id: Option<i64>,
        ids: &[String],
    ) -> Result<(), EngineError> {
        let rows: Vec<Instance> = ids
            .iter()
            .map(|id| Instance::pending(id.clone(), cluster, task_id))
            .collect();
        self.store
            .persist_instances(&rows)
            .await
            .map_err(|e| EngineError::store(format!("{:#}", e)))
    }
}
