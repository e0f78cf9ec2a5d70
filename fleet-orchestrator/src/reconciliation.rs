use crate::engine::Engine;
use crate::retry::RetryPolicy;
use chrono::Utc;
use fleet_common::{ClusterInfo, InstancePatch, Tag, TAG_TASK_ID};
use std::collections::{HashMap, HashSet};

const IN_CLOUD: u8 = 0b01;
const IN_MEMORY: u8 = 0b10;

/// Splits two id lists into (only in `cloud_ids`, only in `memory_ids`).
/// Each id gets a two-bit membership mark; output keeps first-seen order
/// and holds no duplicates.
pub fn cloud_diff(cloud_ids: &[String], memory_ids: &[String]) -> (Vec<String>, Vec<String>) {
    let mut marks: HashMap<&str, u8> = HashMap::with_capacity(cloud_ids.len() + memory_ids.len());
    let mut order: Vec<&str> = Vec::new();
    let tagged = cloud_ids
        .iter()
        .map(|id| (id, IN_CLOUD))
        .chain(memory_ids.iter().map(|id| (id, IN_MEMORY)));
    for (id, bit) in tagged {
        let mark = marks.entry(id.as_str()).or_insert_with(|| {
            order.push(id.as_str());
            0
        });
        *mark |= bit;
    }

    let mut only_cloud = Vec::new();
    let mut only_memory = Vec::new();
    for id in order {
        match marks[id] {
            IN_CLOUD => only_cloud.push(id.to_string()),
            IN_MEMORY => only_memory.push(id.to_string()),
            _ => {}
        }
    }
    (only_cloud, only_memory)
}

/// `first` followed by the ids of `second` it lacks, deduplicated.
fn union_ordered(first: Vec<String>, second: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(first.len() + second.len());
    let mut out = Vec::with_capacity(first.len() + second.len());
    for id in first.into_iter().chain(second.iter().cloned()) {
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

impl Engine {
    fn repair_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.settings.repair_attempts, self.settings.repair_backoff)
    }

    /// One reconciliation pass for the instances of `task_id`.
    ///
    /// `available_ids` are the ids the caller believes alive, `all_ids` every
    /// id it has on record for the task. Instances the vendor has but the
    /// caller does not expect are deleted at the vendor; ids that are no
    /// longer alive are soft-deleted in the store. Both steps are retried
    /// and only logged on failure. Returns how many of `available_ids` the
    /// vendor still has.
    pub async fn repair_cluster(
        &self,
        cluster: &ClusterInfo,
        task_id: i64,
        available_ids: &[String],
        all_ids: &[String],
    ) -> usize {
        let tags = [Tag::new(TAG_TASK_ID, task_id.to_string())];
        let cloud_ids: Vec<String> = match self.get_instances_by_tags(cluster, &tags).await {
            Ok(instances) => {
                tracing::info!(
                    "[RepairCluster] task_id={} cloud={} available={} all={}",
                    task_id,
                    instances.len(),
                    available_ids.len(),
                    all_ids.len()
                );
                instances.into_iter().map(|i| i.id).collect()
            }
            Err(e) => {
                tracing::error!(
                    "[RepairCluster] task_id={} cluster={} tag query failed, using empty cloud set: {}",
                    task_id,
                    cluster.name,
                    e
                );
                vec![]
            }
        };

        let (only_cloud, only_memory) = cloud_diff(&cloud_ids, available_ids);
        let policy = self.repair_policy();

        if !only_cloud.is_empty() {
            tracing::info!(
                "[RepairCluster] task_id={} cluster={} shrinking {} leaked instances",
                task_id,
                cluster.name,
                only_cloud.len()
            );
            let leaked = &only_cloud;
            if let Err(e) = policy
                .run("RepairCluster", move || self.shrink(cluster, leaked))
                .await
            {
                tracing::error!(
                    "[RepairCluster] task_id={} cluster={} shrink failed: {}",
                    task_id,
                    cluster.name,
                    e
                );
            }
        }

        let (lost, unrecorded) = cloud_diff(all_ids, available_ids);
        if !unrecorded.is_empty() {
            tracing::warn!(
                "[RepairCluster] task_id={} cluster={} {} available ids missing from the full id list: {:?}",
                task_id,
                cluster.name,
                unrecorded.len(),
                unrecorded
            );
        }
        let delete_ids = union_ordered(lost, &only_memory);

        if !delete_ids.is_empty() {
            tracing::info!(
                "[RepairCluster] task_id={} cluster={} marking {} instances deleted",
                task_id,
                cluster.name,
                delete_ids.len()
            );
            let (store, stale) = (&self.store, &delete_ids);
            let update = move || async move {
                let patch = InstancePatch::deleted(Utc::now());
                store
                    .soft_delete_instances(stale, &patch)
                    .await
                    .map_err(|e| format!("{:#}", e))
            };
            match policy.run("RepairCluster", update).await {
                Ok(rows) => tracing::debug!("[RepairCluster] task_id={} {} rows updated", task_id, rows),
                Err(e) => tracing::error!(
                    "[RepairCluster] task_id={} cluster={} soft delete failed: {}",
                    task_id,
                    cluster.name,
                    e
                ),
            }
        }

        available_ids.len().saturating_sub(only_memory.len())
    }
}
