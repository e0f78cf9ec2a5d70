use crate::engine::Engine;
use crate::params::{build_params, engine_tags};
use fleet_common::{ClusterInfo, EngineError, Params, Tag};
use fleet_providers::CloudProvider;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ids obtained by an expansion and the error that kept it short, if any.
/// Ids are returned even when `error` is set.
#[derive(Debug, Default)]
pub struct ExpandReport {
    pub instance_ids: Vec<String>,
    pub error: Option<EngineError>,
}

impl ExpandReport {
    fn failed(error: EngineError) -> Self {
        Self {
            instance_ids: vec![],
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Something went wrong but at least one instance came up.
    pub fn is_partial_success(&self) -> bool {
        self.error.is_some() && !self.instance_ids.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<String>, EngineError> {
        match self.error {
            None => Ok(self.instance_ids),
            Some(e) => Err(e),
        }
    }
}

/// Number of batches needed for `num` instances at `each_max` per batch.
pub fn get_batch(num: usize, each_max: usize) -> usize {
    num.div_ceil(each_max.max(1))
}

/// Per-batch sizes: full batches of `each_max`, the remainder last.
pub fn batch_sizes(num: usize, each_max: usize) -> Vec<usize> {
    let each_max = each_max.max(1);
    (0..get_batch(num, each_max))
        .map(|i| each_max.min(num - i * each_max))
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs one `batch_create` per entry of `sizes` concurrently and waits for
/// every unit to report. A failing or panicking unit only costs its own
/// batch.
async fn fan_out(
    provider: Arc<dyn CloudProvider>,
    params: Arc<Params>,
    sizes: Vec<usize>,
) -> (Vec<String>, Vec<EngineError>) {
    let units = sizes.len();
    let (ids_tx, mut ids_rx) = mpsc::channel::<(usize, Vec<String>)>(units.max(1));
    let (err_tx, mut err_rx) = mpsc::channel::<(usize, EngineError)>(units.max(1));

    for (unit, size) in sizes.into_iter().enumerate() {
        let provider = provider.clone();
        let params = params.clone();
        let ids_tx = ids_tx.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(provider.batch_create(&params, size))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(ids)) => {
                    tracing::debug!("[Expand] unit {} created {} of {}", unit, ids.len(), size);
                    let _ = ids_tx.send((unit, ids)).await;
                }
                Ok(Err(e)) => {
                    tracing::error!("[Expand] unit {} BatchCreate({}) failed: {:#}", unit, size, e);
                    let err = EngineError::vendor(provider.provider_type(), format!("{:#}", e));
                    let _ = err_tx.send((unit, err)).await;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("[Expand] unit {} panicked: {}", unit, message);
                    let _ = err_tx.send((unit, EngineError::UnitFault { unit, message })).await;
                }
            }
        });
    }
    drop(ids_tx);
    drop(err_tx);

    let mut ids = Vec::new();
    let mut errors = Vec::new();
    let mut pending: BTreeSet<usize> = (0..units).collect();
    while !pending.is_empty() {
        tokio::select! {
            Some((unit, batch)) = ids_rx.recv() => {
                pending.remove(&unit);
                ids.extend(batch);
            }
            Some((unit, err)) = err_rx.recv() => {
                pending.remove(&unit);
                errors.push(err);
            }
            else => break,
        }
    }
    // Units whose task died before sending anything.
    for unit in pending {
        errors.push(EngineError::UnitFault {
            unit,
            message: "unit exited without reporting".to_string(),
        });
    }
    (ids, errors)
}

impl Engine {
    /// Creates `num` instances for `cluster` in batches of at most
    /// `batch_max`, one concurrent unit per batch. Never returns more than
    /// `num` ids.
    pub async fn expand(&self, cluster: &ClusterInfo, tags: &[Tag], num: usize) -> ExpandReport {
        if num == 0 {
            return ExpandReport::default();
        }
        let provider = match self.provider(cluster).await {
            Ok(p) => p,
            Err(e) => return ExpandReport::failed(e),
        };
        let params = match build_params(cluster, tags, self.store()).await {
            Ok(p) => p,
            Err(e) => return ExpandReport::failed(e),
        };

        let sizes = batch_sizes(num, self.settings.batch_max);
        tracing::info!(
            "[Expand] cluster={} provider={} num={} batches={}",
            cluster.name,
            cluster.provider,
            num,
            sizes.len()
        );
        let (mut instance_ids, causes) = fan_out(provider, Arc::new(params), sizes).await;
        if instance_ids.len() > num {
            // Surplus instances carry the task tags; a repair pass reaps them.
            let surplus = instance_ids.split_off(num);
            tracing::warn!(
                "[Expand] cluster={} vendor returned {} ids for {} requested, dropping {:?}",
                cluster.name,
                num + surplus.len(),
                num,
                surplus
            );
        }

        let error = if causes.is_empty() {
            None
        } else {
            Some(EngineError::PartialFailure {
                requested: num,
                obtained: instance_ids.len(),
                causes,
            })
        };
        ExpandReport {
            instance_ids,
            error,
        }
    }

    /// Expansion with a bounded outer retry: each attempt asks for whatever
    /// is still missing. Stops as soon as `num` ids are held, or on a
    /// configuration error that another attempt cannot fix.
    pub async fn expand_in_deed(&self, cluster: &ClusterInfo, num: usize, task_id: i64) -> ExpandReport {
        let tags = engine_tags(task_id, &cluster.name);
        let mut acquired: Vec<String> = Vec::with_capacity(num);
        let mut last_error = None;

        for attempt in 0..self.settings.expand_retry {
            let need = num.saturating_sub(acquired.len());
            if need == 0 {
                break;
            }
            let report = self.expand(cluster, &tags, need).await;
            if let Some(e) = &report.error {
                tracing::error!(
                    "[ExpandCluster] task_id={} cluster={} attempt {} got {}/{}: {}",
                    task_id,
                    cluster.name,
                    attempt + 1,
                    report.instance_ids.len(),
                    need,
                    e
                );
            }
            let fatal = report.error.as_ref().is_some_and(|e| e.is_config());
            acquired.extend(report.instance_ids);
            last_error = report.error;
            if fatal {
                break;
            }
        }

        if acquired.len() >= num {
            last_error = None;
        }
        tracing::info!(
            "[ExpandCluster] task_id={} cluster={} obtained {}/{}",
            task_id,
            cluster.name,
            acquired.len(),
            num
        );
        ExpandReport {
            instance_ids: acquired,
            error: last_error,
        }
    }

    /// Dry-run create of a single instance: validates the cluster descriptor,
    /// credentials and vendor-side parameters without creating anything.
    pub async fn check_cluster_params(&self, cluster: &ClusterInfo) -> Result<(), EngineError> {
        let provider = self.provider(cluster).await?;
        let mut params = build_params(cluster, &[], self.store()).await?;
        params.dry_run = true;
        provider
            .batch_create(&params, 1)
            .await
            .map_err(|e| EngineError::vendor(provider.provider_type(), format!("{:#}", e)))?;
        Ok(())
    }
}
