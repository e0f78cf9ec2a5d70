use crate::credentials::SecretResolver;
use fleet_common::{ClusterInfo, ConfigError, EngineError, ProviderType};
use fleet_providers::CloudProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Identity of a cached vendor client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider: ProviderType,
    pub access_key: String,
    pub region_id: String,
}

impl ProviderKey {
    pub fn for_cluster(cluster: &ClusterInfo) -> Result<Self, ConfigError> {
        Ok(Self {
            provider: cluster.provider.parse()?,
            access_key: cluster.account_key.clone(),
            region_id: cluster.region_id.clone(),
        })
    }
}

/// Builds a vendor client once its secret is known.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, key: &ProviderKey, secret: &str) -> Result<Arc<dyn CloudProvider>, EngineError>;
}

/// Factory over the adapters compiled into this binary.
#[derive(Debug, Default)]
pub struct VendorFactory;

impl ProviderFactory for VendorFactory {
    #[allow(unreachable_patterns, unused_variables)]
    fn build(&self, key: &ProviderKey, secret: &str) -> Result<Arc<dyn CloudProvider>, EngineError> {
        let (ak, region) = (key.access_key.as_str(), key.region_id.as_str());
        let vendor = |e: anyhow::Error| EngineError::vendor(key.provider, e);
        let provider: Arc<dyn CloudProvider> = match key.provider {
            #[cfg(feature = "provider-alibaba")]
            ProviderType::Alibaba => Arc::new(
                fleet_providers::alibaba::AlibabaProvider::new(ak, secret, region).map_err(vendor)?,
            ),
            #[cfg(feature = "provider-tencent")]
            ProviderType::Tencent => Arc::new(
                fleet_providers::tencent::TencentProvider::new(ak, secret, region).map_err(vendor)?,
            ),
            #[cfg(feature = "provider-huawei")]
            ProviderType::Huawei => Arc::new(
                fleet_providers::huawei::HuaweiProvider::new(ak, secret, region).map_err(vendor)?,
            ),
            #[cfg(feature = "provider-baidu")]
            ProviderType::Baidu => Arc::new(
                fleet_providers::baidu::BaiduProvider::new(ak, secret, region).map_err(vendor)?,
            ),
            #[cfg(feature = "provider-aws")]
            ProviderType::Aws => Arc::new(
                fleet_providers::aws::AwsProvider::new(ak, secret, region).map_err(vendor)?,
            ),
            #[cfg(feature = "provider-mock")]
            ProviderType::Mock => Arc::new(fleet_providers::mock::MockProvider::new(region)),
            other => {
                return Err(ConfigError::UnsupportedProvider(format!(
                    "{} (not compiled in)",
                    other
                ))
                .into())
            }
        };
        Ok(provider)
    }
}

type Slot = Arc<OnceCell<Arc<dyn CloudProvider>>>;

/// Process-wide cache of vendor clients keyed by (provider, access key,
/// region). Each key is constructed at most once, even when many tasks ask
/// for it concurrently; a failed construction leaves the slot empty.
pub struct ProviderRegistry {
    secrets: Arc<dyn SecretResolver>,
    factory: Arc<dyn ProviderFactory>,
    cache: Mutex<HashMap<ProviderKey, Slot>>,
}

impl ProviderRegistry {
    pub fn new(secrets: Arc<dyn SecretResolver>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            secrets,
            factory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &ProviderKey) -> Slot {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entry(key.clone()).or_default().clone()
    }

    pub async fn get_or_create(
        &self,
        cluster: &ClusterInfo,
    ) -> Result<Arc<dyn CloudProvider>, EngineError> {
        let key = ProviderKey::for_cluster(cluster)?;
        self.get_or_create_key(&key).await
    }

    pub async fn get_or_create_key(
        &self,
        key: &ProviderKey,
    ) -> Result<Arc<dyn CloudProvider>, EngineError> {
        let slot = self.slot(key);
        let provider = slot
            .get_or_try_init(|| async {
                let secret = self.secrets.resolve_secret(&key.access_key).await?;
                tracing::info!(
                    "[ProviderRegistry] building {} client region={} access_key={}",
                    key.provider,
                    key.region_id,
                    key.access_key
                );
                self.factory.build(key, &secret)
            })
            .await?;
        Ok(provider.clone())
    }

    /// Keys with a slot, built or not.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
