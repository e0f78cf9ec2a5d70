use anyhow::Result;
use async_trait::async_trait;
use fleet_common::{CloudInstance, Params, ProviderType, Tag};

pub mod http;
pub mod signing;

/// Uniform contract over every cloud vendor.
///
/// A single client is shared by every concurrent caller for a given
/// (vendor, access key, region), so implementations must be safe to call
/// from many tasks at once. They hold no per-call mutable state.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Create `num` instances from `params` in one vendor call.
    /// With `params.dry_run` set, only validates and returns an empty list.
    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>>;

    /// Delete instances in bulk. Empty `ids` is a no-op.
    async fn batch_delete(&self, ids: &[String], region_id: &str) -> Result<()>;

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>>;

    /// Instances carrying every tag in `tags`.
    async fn get_instances_by_tags(
        &self,
        region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>>;

    async fn get_instances_by_cluster(
        &self,
        region_id: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudInstance>> {
        let tags = [Tag::new(fleet_common::TAG_CLUSTER_NAME, cluster_name)];
        self.get_instances_by_tags(region_id, &tags).await
    }

    // Optional: power management and networking primitives used by sibling
    // features (EIP binding, key pair import). Defaults report "unsupported"
    // so providers that lack them still compile.

    async fn start_instances(&self, _ids: &[String]) -> Result<()> {
        Err(unsupported(self.provider_type(), "start_instances"))
    }

    async fn stop_instances(&self, _ids: &[String]) -> Result<()> {
        Err(unsupported(self.provider_type(), "stop_instances"))
    }

    /// Returns the allocated EIP ids.
    async fn allocate_eip(
        &self,
        _region_id: &str,
        _bandwidth_mbps: i32,
        _num: usize,
    ) -> Result<Vec<String>> {
        Err(unsupported(self.provider_type(), "allocate_eip"))
    }

    async fn release_eip(&self, _eip_ids: &[String]) -> Result<()> {
        Err(unsupported(self.provider_type(), "release_eip"))
    }

    async fn associate_eip(&self, _eip_id: &str, _instance_id: &str) -> Result<()> {
        Err(unsupported(self.provider_type(), "associate_eip"))
    }

    async fn disassociate_eip(&self, _eip_id: &str) -> Result<()> {
        Err(unsupported(self.provider_type(), "disassociate_eip"))
    }

    async fn create_key_pair(
        &self,
        _region_id: &str,
        _key_pair_name: &str,
    ) -> Result<inventory::KeyPairMaterial> {
        Err(unsupported(self.provider_type(), "create_key_pair"))
    }

    async fn import_key_pair(
        &self,
        _region_id: &str,
        _key_pair_name: &str,
        _public_key: &str,
    ) -> Result<inventory::KeyPairMaterial> {
        Err(unsupported(self.provider_type(), "import_key_pair"))
    }
}

pub fn unsupported(provider: ProviderType, op: &str) -> anyhow::Error {
    anyhow::anyhow!("{} does not support {}", provider, op)
}

/// True when every tag in `wanted` is present on `have`.
pub fn has_all_tags(have: &[Tag], wanted: &[Tag]) -> bool {
    wanted.iter().all(|w| have.contains(w))
}

pub mod inventory {
    #[derive(Clone, Debug, PartialEq)]
    pub struct KeyPairMaterial {
        pub key_pair_id: String,
        pub key_pair_name: String,
        pub public_key: String,
        pub private_key: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "alibaba")]
pub mod alibaba;

#[cfg(feature = "tencent")]
pub mod tencent;

#[cfg(feature = "huawei")]
pub mod huawei;

#[cfg(feature = "baidu")]
pub mod baidu;

#[cfg(feature = "aws")]
pub mod aws;
