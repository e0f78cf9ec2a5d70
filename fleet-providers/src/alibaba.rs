use crate::http::{build_client, str_field};
use crate::signing::{base64_encode, canonical_query, hmac_sha1, percent_encode};
use crate::{has_all_tags, CloudProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{CloudInstance, Params, ProviderType, Tag};
use reqwest::Client;
use serde_json::Value;

const ECS_ENDPOINT: &str = "https://ecs.aliyuncs.com/";
const ECS_VERSION: &str = "2014-05-26";
const VPC_ENDPOINT: &str = "https://vpc.aliyuncs.com/";
const VPC_VERSION: &str = "2016-04-28";
// DescribeInstances / DeleteInstances accept at most 100 ids per call.
const MAX_IDS_PER_CALL: usize = 100;
const PAGE_SIZE: usize = 100;

/// Alibaba Cloud ECS over the signed RPC API.
pub struct AlibabaProvider {
    client: Client,
    access_key: String,
    secret_key: String,
    region_id: String,
}

impl AlibabaProvider {
    pub fn new(access_key: &str, secret_key: &str, region_id: &str) -> Result<Self> {
        let region_id = region_id.trim();
        if region_id.is_empty() {
            return Err(anyhow::anyhow!("Alibaba region id is empty"));
        }
        Ok(Self {
            client: build_client()?,
            access_key: access_key.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            region_id: region_id.to_string(),
        })
    }

    /// Signs `params` with the RPC HMAC-SHA1 scheme and returns the full
    /// query string including `Signature`.
    fn signed_query(
        &self,
        version: &str,
        action: &str,
        mut params: Vec<(String, String)>,
        now: DateTime<Utc>,
        nonce: &str,
    ) -> String {
        params.extend([
            ("Action".to_string(), action.to_string()),
            ("Format".to_string(), "JSON".to_string()),
            ("Version".to_string(), version.to_string()),
            ("AccessKeyId".to_string(), self.access_key.clone()),
            ("SignatureMethod".to_string(), "HMAC-SHA1".to_string()),
            ("SignatureVersion".to_string(), "1.0".to_string()),
            ("SignatureNonce".to_string(), nonce.to_string()),
            (
                "Timestamp".to_string(),
                now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ]);
        let canonical = canonical_query(&params);
        let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&canonical));
        let key = format!("{}&", self.secret_key);
        let signature = base64_encode(&hmac_sha1(key.as_bytes(), string_to_sign.as_bytes()));
        format!("{}&Signature={}", canonical, percent_encode(&signature))
    }

    async fn call(
        &self,
        endpoint: &str,
        version: &str,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let query = self.signed_query(version, action, params, Utc::now(), &nonce);
        let url = format!("{}?{}", endpoint, query);
        tracing::debug!("[Alibaba API] {} region={}", action, self.region_id);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let code = str_field(&body, "Code").unwrap_or_default();
            let message = str_field(&body, "Message").unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Alibaba {} failed: status={} code={} message={}",
                action,
                status.as_u16(),
                code,
                message
            ));
        }
        parse_body(action, &text)
    }

    async fn ecs(&self, action: &str, params: Vec<(String, String)>) -> Result<Value> {
        self.call(ECS_ENDPOINT, ECS_VERSION, action, params).await
    }

    async fn describe(&self, filter: Vec<(String, String)>) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let mut params = filter.clone();
            params.push(("PageSize".into(), PAGE_SIZE.to_string()));
            params.push(("PageNumber".into(), page.to_string()));
            let body = self.ecs("DescribeInstances", params).await?;
            let items = body["Instances"]["Instance"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let total = body["TotalCount"].as_u64().unwrap_or(0) as usize;
            let fetched = items.len();
            out.extend(items.iter().map(to_cloud_instance));
            if fetched == 0 || out.len() >= total {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    async fn instance_action(&self, action: &str, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let mut params = vec![("RegionId".to_string(), self.region_id.clone())];
            params.extend(indexed("InstanceId", chunk));
            self.ecs(action, params).await?;
        }
        Ok(())
    }
}

fn parse_body(action: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .with_context(|| format!("Alibaba {} returned invalid JSON: {}", action, text))
}

fn indexed(prefix: &str, values: &[String]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{}.{}", prefix, i + 1), v.clone()))
        .collect()
}

fn tag_params(tags: &[Tag]) -> Vec<(String, String)> {
    tags.iter()
        .enumerate()
        .flat_map(|(i, t)| {
            [
                (format!("Tag.{}.Key", i + 1), t.key.clone()),
                (format!("Tag.{}.Value", i + 1), t.value.clone()),
            ]
        })
        .collect()
}

/// Canonical params -> RunInstances query parameters.
fn run_instances_params(m: &Params, num: usize) -> Vec<(String, String)> {
    let mut p: Vec<(String, String)> = vec![
        ("RegionId".into(), m.region.clone()),
        ("ZoneId".into(), m.zone.clone()),
        ("ImageId".into(), m.image_id.clone()),
        ("InstanceType".into(), m.instance_type.clone()),
        ("SecurityGroupId".into(), m.network.security_group.clone()),
        ("VSwitchId".into(), m.network.subnet_id.clone()),
        ("Amount".into(), num.to_string()),
        ("DryRun".into(), m.dry_run.to_string()),
    ];
    if !m.network.internet_charge_type.is_empty() {
        p.push(("InternetChargeType".into(), m.network.internet_charge_type.clone()));
    }
    if m.network.internet_max_bandwidth_out > 0 {
        p.push((
            "InternetMaxBandwidthOut".into(),
            m.network.internet_max_bandwidth_out.to_string(),
        ));
    }
    if !m.disks.system_disk.category.is_empty() {
        p.push(("SystemDisk.Category".into(), m.disks.system_disk.category.clone()));
    }
    if m.disks.system_disk.size_gb > 0 {
        p.push(("SystemDisk.Size".into(), m.disks.system_disk.size_gb.to_string()));
    }
    for (i, d) in m.disks.data_disks.iter().enumerate() {
        p.push((format!("DataDisk.{}.Category", i + 1), d.category.clone()));
        p.push((format!("DataDisk.{}.Size", i + 1), d.size_gb.to_string()));
    }
    if !m.charge.charge_type.is_empty() {
        p.push(("InstanceChargeType".into(), m.charge.charge_type.clone()));
        if m.charge.charge_type == "PrePaid" {
            p.push(("Period".into(), m.charge.period.to_string()));
            p.push(("PeriodUnit".into(), m.charge.period_unit.clone()));
        }
    }
    if let Some(pw) = m.password.as_deref().filter(|s| !s.is_empty()) {
        p.push(("Password".into(), pw.to_string()));
    }
    if let Some(name) = m.key_pair_name.as_deref().filter(|s| !s.is_empty()) {
        p.push(("KeyPairName".into(), name.to_string()));
    }
    p.extend(tag_params(&m.tags));
    p
}

fn first_ip(v: &Value) -> Option<String> {
    v["IpAddress"]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn to_cloud_instance(item: &Value) -> CloudInstance {
    let ip_outer = first_ip(&item["PublicIpAddress"])
        .or_else(|| str_field(&item["EipAddress"], "IpAddress"));
    let tags = item["Tags"]["Tag"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| Some(Tag::new(str_field(t, "TagKey")?, str_field(t, "TagValue")?)))
                .collect()
        })
        .unwrap_or_default();
    CloudInstance {
        id: str_field(item, "InstanceId").unwrap_or_default(),
        provider: Some(ProviderType::Alibaba),
        ip_inner: first_ip(&item["VpcAttributes"]["PrivateIpAddress"]),
        ip_outer,
        image_id: str_field(item, "ImageId"),
        vpc_id: str_field(&item["VpcAttributes"], "VpcId"),
        subnet_id: str_field(&item["VpcAttributes"], "VSwitchId"),
        status: str_field(item, "Status").unwrap_or_default(),
        charge_type: str_field(item, "InstanceChargeType"),
        tags,
        expire_at: str_field(item, "ExpiredTime").and_then(|s| parse_expired_time(&s)),
    }
}

/// ECS reports expiry at minute precision, e.g. `2024-01-02T03:04Z`.
fn parse_expired_time(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|n| n.and_utc())
}

#[async_trait]
impl CloudProvider for AlibabaProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Alibaba
    }

    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>> {
        match self.ecs("RunInstances", run_instances_params(params, num)).await {
            Ok(body) => {
                if params.dry_run {
                    return Ok(vec![]);
                }
                let ids = body["InstanceIdSets"]["InstanceIdSet"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ids)
            }
            // A passing dry run is reported as a DryRunOperation "error".
            Err(e) if params.dry_run && e.to_string().contains("code=DryRunOperation") => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    async fn batch_delete(&self, ids: &[String], region_id: &str) -> Result<()> {
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let mut params = vec![
                ("RegionId".to_string(), region_id.to_string()),
                ("Force".to_string(), "true".to_string()),
            ];
            params.extend(indexed("InstanceId", chunk));
            self.ecs("DeleteInstances", params).await?;
        }
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let filter = vec![
                ("RegionId".to_string(), self.region_id.clone()),
                ("InstanceIds".to_string(), serde_json::to_string(chunk)?),
            ];
            out.extend(self.describe(filter).await?);
        }
        Ok(out)
    }

    async fn get_instances_by_tags(
        &self,
        region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        let mut filter = vec![("RegionId".to_string(), region_id.to_string())];
        filter.extend(tag_params(tags));
        let found = self.describe(filter).await?;
        Ok(found
            .into_iter()
            .filter(|i| has_all_tags(&i.tags, tags))
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        self.instance_action("StartInstances", ids).await
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        self.instance_action("StopInstances", ids).await
    }

    async fn allocate_eip(
        &self,
        region_id: &str,
        bandwidth_mbps: i32,
        num: usize,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(num);
        for _ in 0..num {
            let body = self
                .call(
                    VPC_ENDPOINT,
                    VPC_VERSION,
                    "AllocateEipAddress",
                    vec![
                        ("RegionId".into(), region_id.to_string()),
                        ("Bandwidth".into(), bandwidth_mbps.to_string()),
                    ],
                )
                .await?;
            if let Some(id) = str_field(&body, "AllocationId") {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn release_eip(&self, eip_ids: &[String]) -> Result<()> {
        for id in eip_ids {
            self.call(
                VPC_ENDPOINT,
                VPC_VERSION,
                "ReleaseEipAddress",
                vec![("AllocationId".into(), id.clone())],
            )
            .await?;
        }
        Ok(())
    }
}
