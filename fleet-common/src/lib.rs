use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;

pub use error::{ConfigError, EngineError};

// --- Tags ---

/// Tag key carrying the id of the task that created an instance.
pub const TAG_TASK_ID: &str = "TaskId";
/// Tag key carrying the name of the cluster an instance belongs to.
pub const TAG_CLUSTER_NAME: &str = "ClusterName";

/// Keys set by the engine itself; callers cannot override them.
pub const RESERVED_TAG_KEYS: [&str; 2] = [TAG_TASK_ID, TAG_CLUSTER_NAME];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_TAG_KEYS.contains(&self.key.as_str())
    }
}

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    #[serde(rename = "AlibabaCloud")]
    Alibaba,
    #[serde(rename = "TencentCloud")]
    Tencent,
    #[serde(rename = "HuaweiCloud")]
    Huawei,
    #[serde(rename = "BaiduCloud")]
    Baidu,
    #[serde(rename = "AWSCloud")]
    Aws,
    #[serde(rename = "Mock")]
    Mock,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Alibaba => "AlibabaCloud",
            ProviderType::Tencent => "TencentCloud",
            ProviderType::Huawei => "HuaweiCloud",
            ProviderType::Baidu => "BaiduCloud",
            ProviderType::Aws => "AWSCloud",
            ProviderType::Mock => "Mock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "AlibabaCloud" => Some(ProviderType::Alibaba),
            "TencentCloud" => Some(ProviderType::Tencent),
            "HuaweiCloud" => Some(ProviderType::Huawei),
            "BaiduCloud" => Some(ProviderType::Baidu),
            "AWSCloud" => Some(ProviderType::Aws),
            "Mock" => Some(ProviderType::Mock),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderType::parse(s).ok_or_else(|| ConfigError::UnsupportedProvider(s.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Password,
    KeyPair,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "fleet_instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending, // Create accepted by the vendor, not yet reachable
    Running, // Alive and accounted for
    Failed,  // Never came up
    Deleted, // Soft-deleted in the system-of-record
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Deleted => "deleted",
        }
    }
}

// --- Cluster descriptor ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct NetworkConfig {
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group: String,
    pub internet_charge_type: String,
    pub internet_max_bandwidth_out: i32,
    pub internet_ip_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DiskConf {
    pub category: String,
    pub size_gb: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StorageConfig {
    pub system_disk: DiskConf,
    #[serde(default)]
    pub data_disks: Vec<DiskConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChargeConfig {
    pub charge_type: String,
    pub period: i32,
    pub period_unit: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ImageConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Everything needed to provision instances for one cluster. Supplied by the
/// caller and never mutated by the engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ClusterInfo {
    pub name: String,
    pub provider: String,
    pub account_key: String,
    pub region_id: String,
    pub zone_id: String,

    pub instance_type: String,
    pub image: String,
    #[serde(default)]
    pub image_config: ImageConfig,
    #[serde(default)]
    pub network_config: NetworkConfig,
    #[serde(default)]
    pub storage_config: StorageConfig,
    #[serde(default)]
    pub charge_config: ChargeConfig,

    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_id: Option<i64>,

    /// Extra caller tags. Reserved keys are ignored.
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Vendor-agnostic create request. Derived per call, never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Params {
    pub provider: ProviderType,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub network: NetworkConfig,
    pub disks: StorageConfig,
    pub charge: ChargeConfig,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub key_pair_id: Option<String>,
    pub key_pair_name: Option<String>,
    pub tags: Vec<Tag>,
    pub dry_run: bool,
}

impl Params {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// An instance as the vendor reports it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CloudInstance {
    pub id: String,
    pub provider: Option<ProviderType>,
    pub ip_inner: Option<String>,
    pub ip_outer: Option<String>,
    pub image_id: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub status: String,
    pub charge_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub expire_at: Option<DateTime<Utc>>,
}

// --- Entities (SQLx Mapped) ---

/// System-of-record row for one instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct Instance {
    pub instance_id: String,
    pub cluster_name: String,
    pub provider: String,
    pub task_id: Option<i64>,
    pub ip_inner: Option<String>,
    pub ip_outer: Option<String>,
    pub eip_id: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn pending(
        instance_id: impl Into<String>,
        cluster: &ClusterInfo,
        task_id: Option<i64>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            cluster_name: cluster.name.clone(),
            provider: cluster.provider.clone(),
            task_id,
            ip_inner: None,
            ip_outer: None,
            eip_id: None,
            status: InstanceStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some() || self.status == InstanceStatus::Deleted
    }
}

/// Columns touched by a bulk status update.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePatch {
    pub status: InstanceStatus,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl InstancePatch {
    pub fn deleted(now: DateTime<Utc>) -> Self {
        Self {
            status: InstanceStatus::Deleted,
            updated_at: now,
            deleted_at: Some(now),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct KeyPair {
    pub id: i64,
    pub provider: String,
    pub region_id: String,
    pub key_pair_name: String,
    pub key_pair_id: String,
    pub public_key: String,
    #[serde(skip)] // Never serialize private key material
    pub private_key: String,
    pub key_type: String,
}

// --- Queries ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct InstanceFilter {
    pub cluster_names: Vec<String>,
    pub statuses: Vec<InstanceStatus>,
    pub instance_id: Option<String>,
    pub ip: Option<String>,
}

/// 1-based page request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 10;
    pub const MAX_SIZE: u32 = 500;

    pub fn new(number: u32, size: u32) -> Self {
        let size = match size {
            0 => Self::DEFAULT_SIZE,
            s => s.min(Self::MAX_SIZE),
        };
        Self {
            number: number.max(1),
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.number.max(1) as u64 - 1) * self.size as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new(1, Self::DEFAULT_SIZE)
    }
}
