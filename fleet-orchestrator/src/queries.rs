use crate::engine::Engine;
use fleet_common::{
    CloudInstance, ClusterInfo, EngineError, Instance, InstanceFilter, InstanceStatus, Page, Tag,
};
use serde::{Deserialize, Serialize};

/// Listing conditions across several accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancesCond {
    pub account_keys: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<InstanceStatus>,
    pub instance_id: Option<String>,
    pub ip: Option<String>,
    pub cluster_name: Option<String>,
    pub provider: Option<String>,
    #[serde(default)]
    pub page: Page,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstancePage {
    pub cluster_names: Vec<String>,
    pub instances: Vec<Instance>,
    pub total: i64,
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::store(format!("{:#}", e))
}

impl Engine {
    pub async fn get_instances(
        &self,
        cluster: &ClusterInfo,
        ids: &[String],
    ) -> Result<Vec<CloudInstance>, EngineError> {
        let provider = self.provider(cluster).await?;
        provider
            .get_instances(ids)
            .await
            .map_err(|e| EngineError::vendor(provider.provider_type(), format!("{:#}", e)))
    }

    pub async fn get_instances_by_tags(
        &self,
        cluster: &ClusterInfo,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>, EngineError> {
        let provider = self.provider(cluster).await?;
        provider
            .get_instances_by_tags(&cluster.region_id, tags)
            .await
            .map_err(|e| EngineError::vendor(provider.provider_type(), format!("{:#}", e)))
    }

    pub async fn get_instances_by_cluster(
        &self,
        cluster: &ClusterInfo,
    ) -> Result<Vec<CloudInstance>, EngineError> {
        let provider = self.provider(cluster).await?;
        provider
            .get_instances_by_cluster(&cluster.region_id, &cluster.name)
            .await
            .map_err(|e| EngineError::vendor(provider.provider_type(), format!("{:#}", e)))
    }

    /// Live store rows of every enabled cluster owned by `account_key`.
    pub async fn get_instances_by_account(
        &self,
        account_key: &str,
        page: Page,
    ) -> Result<(Vec<Instance>, i64), EngineError> {
        let names = self
            .store
            .enabled_cluster_names(&[account_key.to_string()], None, None)
            .await
            .map_err(store_err)?;
        if names.is_empty() {
            return Ok((vec![], 0));
        }
        let filter = InstanceFilter {
            cluster_names: names,
            ..Default::default()
        };
        self.store.query_instances(&filter, page).await.map_err(store_err)
    }

    pub async fn get_instances_by_accounts(
        &self,
        cond: &InstancesCond,
    ) -> Result<InstancePage, EngineError> {
        let cluster_names = self
            .store
            .enabled_cluster_names(
                &cond.account_keys,
                cond.provider.as_deref(),
                cond.cluster_name.as_deref(),
            )
            .await
            .map_err(store_err)?;
        if cluster_names.is_empty() {
            return Ok(InstancePage {
                cluster_names,
                instances: vec![],
                total: 0,
            });
        }
        let filter = InstanceFilter {
            cluster_names: cluster_names.clone(),
            statuses: cond.statuses.clone(),
            instance_id: cond.instance_id.clone(),
            ip: cond.ip.clone(),
        };
        let (instances, total) = self
            .store
            .query_instances(&filter, cond.page)
            .await
            .map_err(store_err)?;
        Ok(InstancePage {
            cluster_names,
            instances,
            total,
        })
    }
}
