use crate::store::FleetStore;
use fleet_common::{
    AuthType, ClusterInfo, ConfigError, EngineError, Params, ProviderType, Tag, TAG_CLUSTER_NAME,
    TAG_TASK_ID,
};

/// Tags the engine stamps on every instance it creates for a task.
pub fn engine_tags(task_id: i64, cluster_name: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_TASK_ID, task_id.to_string()),
        Tag::new(TAG_CLUSTER_NAME, cluster_name),
    ]
}

/// `tags` first, then the cluster's own tags minus reserved keys and keys
/// already present.
pub fn merge_tags(tags: &[Tag], cluster: &ClusterInfo) -> Vec<Tag> {
    let mut out = tags.to_vec();
    for t in cluster.tags.iter().filter(|t| !t.is_reserved()) {
        if !out.iter().any(|o| o.key == t.key) {
            out.push(t.clone());
        }
    }
    out
}

pub async fn build_params(
    cluster: &ClusterInfo,
    tags: &[Tag],
    store: &dyn FleetStore,
) -> Result<Params, EngineError> {
    let provider: ProviderType = cluster.provider.parse()?;
    let image_id = if cluster.image_config.id.is_empty() {
        cluster.image.clone()
    } else {
        cluster.image_config.id.clone()
    };

    let (password, key_pair_id, key_pair_name) = match cluster.auth_type {
        AuthType::Password => (cluster.password.clone(), None, None),
        AuthType::KeyPair => {
            let key_id = cluster.key_id.ok_or_else(|| {
                ConfigError::InvalidCluster(format!(
                    "cluster {} uses key pair auth without a key id",
                    cluster.name
                ))
            })?;
            // Only a missing key pair is a cluster defect; a failed lookup may pass.
            let kp = store
                .get_key_pair(key_id)
                .await
                .map_err(|e| EngineError::store(format!("{:#}", e)))?
                .ok_or_else(|| {
                    ConfigError::InvalidCluster(format!("key pair {} not found", key_id))
                })?;
            (None, Some(kp.key_pair_id), Some(kp.key_pair_name))
        }
    };

    Ok(Params {
        provider,
        region: cluster.region_id.clone(),
        zone: cluster.zone_id.clone(),
        instance_type: cluster.instance_type.clone(),
        image_id,
        network: cluster.network_config.clone(),
        disks: cluster.storage_config.clone(),
        charge: cluster.charge_config.clone(),
        password,
        key_pair_id,
        key_pair_name,
        tags: merge_tags(tags, cluster),
        dry_run: false,
    })
}
