// Shared fixtures: an engine wired to one in-memory vendor and store.
#![allow(dead_code)]

use fleet_common::{ClusterInfo, EngineError};
use fleet_orchestrator::credentials::StaticSecretResolver;
use fleet_orchestrator::store::MemoryFleetStore;
use fleet_orchestrator::{Engine, EngineSettings, ProviderFactory, ProviderKey, ProviderRegistry};
use fleet_providers::mock::MockProvider;
use fleet_providers::CloudProvider;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ACCOUNT_KEY: &str = "ak-test";

/// Hands out the same mock for every key and counts constructions.
pub struct SharedMockFactory {
    pub mock: Arc<MockProvider>,
    pub builds: AtomicUsize,
}

impl ProviderFactory for SharedMockFactory {
    fn build(&self, _key: &ProviderKey, _secret: &str) -> Result<Arc<dyn CloudProvider>, EngineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let provider: Arc<dyn CloudProvider> = self.mock.clone();
        Ok(provider)
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub mock: Arc<MockProvider>,
    pub store: Arc<MemoryFleetStore>,
    pub factory: Arc<SharedMockFactory>,
}

impl Harness {
    pub fn builds(&self) -> usize {
        self.factory.builds.load(Ordering::SeqCst)
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        repair_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(MockProvider::new("local"), fast_settings())
}

pub fn harness_with(mock: MockProvider, settings: EngineSettings) -> Harness {
    let mock = Arc::new(mock);
    let factory = Arc::new(SharedMockFactory {
        mock: mock.clone(),
        builds: AtomicUsize::new(0),
    });
    let registry = Arc::new(ProviderRegistry::new(
        Arc::new(StaticSecretResolver::new([(ACCOUNT_KEY, "sk-test")])),
        factory.clone(),
    ));
    let store = Arc::new(MemoryFleetStore::new());
    let engine = Arc::new(Engine::new(registry, store.clone(), settings));
    Harness {
        engine,
        mock,
        store,
        factory,
    }
}

pub fn cluster(name: &str) -> ClusterInfo {
    ClusterInfo {
        name: name.to_string(),
        provider: "Mock".to_string(),
        account_key: ACCOUNT_KEY.to_string(),
        region_id: "local".to_string(),
        zone_id: "local-a".to_string(),
        instance_type: "small".to_string(),
        image: "img-1".to_string(),
        password: Some("Pa55word!".to_string()),
        ..Default::default()
    }
}

pub fn sorted(mut v: Vec<usize>) -> Vec<usize> {
    v.sort_unstable();
    v
}
