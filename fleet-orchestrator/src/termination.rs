use crate::engine::Engine;
use fleet_common::{ClusterInfo, EngineError};

impl Engine {
    /// Deletes `ids` at the vendor in one bulk call. Empty input succeeds
    /// without touching the registry. No retry here; callers compose it.
    pub async fn shrink(&self, cluster: &ClusterInfo, ids: &[String]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let provider = self.provider(cluster).await?;
        tracing::info!(
            "[Shrink] cluster={} region={} deleting {} instances",
            cluster.name,
            cluster.region_id,
            ids.len()
        );
        provider
            .batch_delete(ids, &cluster.region_id)
            .await
            .map_err(|e| EngineError::vendor(provider.provider_type(), format!("{:#}", e)))
    }
}
