use crate::{has_all_tags, inventory, CloudProvider};
use anyhow::Result;
use async_trait::async_trait;
use fleet_common::{CloudInstance, Params, ProviderType, Tag};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Which `batch_create` call a fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMatch {
    /// The n-th call to arrive (1-based).
    Nth(usize),
    /// The first call asking for exactly this many instances.
    Size(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Vendor rejects the call.
    Reject,
    /// The call panics, as a misbehaving SDK would.
    Panic,
}

#[derive(Default)]
struct MockState {
    instances: Vec<CloudInstance>,
    create_calls: Vec<usize>,
    dry_runs: usize,
    create_faults: Vec<(CallMatch, FaultKind)>,
    delete_calls: Vec<Vec<String>>,
    delete_failures_remaining: usize,
    fail_tag_queries: bool,
    eips: Vec<String>,
}

/// In-memory provider for tests and local runs. Instances live in a table
/// that behaves like a vendor: tags are stored, deletes remove rows.
pub struct MockProvider {
    region_id: String,
    create_delay: Option<Duration>,
    surplus: usize,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(region_id: &str) -> Self {
        Self {
            region_id: region_id.to_string(),
            create_delay: None,
            surplus: 0,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every `batch_create` sleeps this long before answering.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Every `batch_create` launches `extra` more instances than asked for.
    pub fn with_over_delivery(mut self, extra: usize) -> Self {
        self.surplus = extra;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking caller never holds the lock, but recover anyway.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject_create_fault(&self, when: CallMatch, kind: FaultKind) {
        self.lock().create_faults.push((when, kind));
    }

    /// The next `n` calls to `batch_delete` fail.
    pub fn fail_deletes(&self, n: usize) {
        self.lock().delete_failures_remaining = n;
    }

    pub fn fail_tag_queries(&self, fail: bool) {
        self.lock().fail_tag_queries = fail;
    }

    /// Seeds an instance the engine did not create through this client.
    pub fn insert_instance(&self, instance: CloudInstance) {
        self.lock().instances.push(instance);
    }

    /// Drops an instance behind the engine's back.
    pub fn remove_instance(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.instances.len();
        state.instances.retain(|i| i.id != id);
        state.instances.len() != before
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.lock().instances.iter().map(|i| i.id.clone()).collect()
    }

    pub fn instance(&self, id: &str) -> Option<CloudInstance> {
        self.lock().instances.iter().find(|i| i.id == id).cloned()
    }

    /// Sizes requested by each non-dry-run `batch_create`, in arrival order.
    pub fn create_calls(&self) -> Vec<usize> {
        self.lock().create_calls.clone()
    }

    pub fn dry_runs(&self) -> usize {
        self.lock().dry_runs
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.lock().delete_calls.clone()
    }

    fn take_fault(state: &mut MockState, call: usize, size: usize) -> Option<FaultKind> {
        let pos = state.create_faults.iter().position(|(m, _)| match m {
            CallMatch::Nth(n) => *n == call,
            CallMatch::Size(s) => *s == size,
        })?;
        Some(state.create_faults.remove(pos).1)
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Mock
    }

    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>> {
        if params.image_id.trim().is_empty() || params.instance_type.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Mock RunInstances rejected: image and instance type are required"
            ));
        }
        if params.dry_run {
            self.lock().dry_runs += 1;
            return Ok(vec![]);
        }
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let fault = {
            let mut state = self.lock();
            state.create_calls.push(num);
            let call = state.create_calls.len();
            Self::take_fault(&mut state, call, num)
        };
        match fault {
            Some(FaultKind::Panic) => panic!("mock provider fault injected on batch of {}", num),
            Some(FaultKind::Reject) => {
                return Err(anyhow::anyhow!(
                    "Mock RunInstances failed: code=QuotaExceeded batch={}",
                    num
                ))
            }
            None => {}
        }

        let created: Vec<CloudInstance> = (0..num + self.surplus)
            .map(|_| CloudInstance {
                id: format!("mock-{}", uuid::Uuid::new_v4()),
                provider: Some(ProviderType::Mock),
                ip_inner: Some("10.0.0.1".to_string()),
                image_id: Some(params.image_id.clone()),
                vpc_id: Some(params.network.vpc_id.clone()),
                subnet_id: Some(params.network.subnet_id.clone()),
                status: "Pending".to_string(),
                tags: params.tags.clone(),
                ..Default::default()
            })
            .collect();
        let ids = created.iter().map(|i| i.id.clone()).collect();
        self.lock().instances.extend(created);
        Ok(ids)
    }

    async fn batch_delete(&self, ids: &[String], region_id: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        state.delete_calls.push(ids.to_vec());
        if state.delete_failures_remaining > 0 {
            state.delete_failures_remaining -= 1;
            return Err(anyhow::anyhow!(
                "Mock DeleteInstances failed: region={} code=Throttling",
                region_id
            ));
        }
        let doomed: HashSet<&String> = ids.iter().collect();
        state.instances.retain(|i| !doomed.contains(&i.id));
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        let wanted: HashSet<&String> = ids.iter().collect();
        Ok(self
            .lock()
            .instances
            .iter()
            .filter(|i| wanted.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn get_instances_by_tags(
        &self,
        region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        let state = self.lock();
        if state.fail_tag_queries {
            return Err(anyhow::anyhow!(
                "Mock DescribeInstances failed: region={} code=ServiceUnavailable",
                region_id
            ));
        }
        Ok(state
            .instances
            .iter()
            .filter(|i| has_all_tags(&i.tags, tags))
            .cloned()
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        for i in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            i.status = "Running".to_string();
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        for i in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            i.status = "Stopped".to_string();
        }
        Ok(())
    }

    async fn allocate_eip(
        &self,
        _region_id: &str,
        _bandwidth_mbps: i32,
        num: usize,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = (0..num)
            .map(|_| format!("eip-{}", uuid::Uuid::new_v4()))
            .collect();
        self.lock().eips.extend(ids.iter().cloned());
        Ok(ids)
    }

    async fn release_eip(&self, eip_ids: &[String]) -> Result<()> {
        self.lock().eips.retain(|e| !eip_ids.contains(e));
        Ok(())
    }

    async fn import_key_pair(
        &self,
        _region_id: &str,
        key_pair_name: &str,
        public_key: &str,
    ) -> Result<inventory::KeyPairMaterial> {
        Ok(inventory::KeyPairMaterial {
            key_pair_id: format!("kp-{}", key_pair_name),
            key_pair_name: key_pair_name.to_string(),
            public_key: public_key.to_string(),
            private_key: None,
        })
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("region_id", &self.region_id)
            .finish()
    }
}
