use crate::http::{build_client, str_field};
use crate::signing::{hmac_sha256, hmac_sha256_hex, sha256_hex};
use crate::{has_all_tags, CloudProvider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet_common::{CloudInstance, Params, ProviderType, Tag};
use reqwest::Client;
use serde_json::{json, Value};

const CVM_HOST: &str = "cvm.tencentcloudapi.com";
const CVM_SERVICE: &str = "cvm";
const CVM_VERSION: &str = "2017-03-12";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const MAX_IDS_PER_CALL: usize = 100;
const PAGE_SIZE: usize = 100;

/// Tencent Cloud CVM over API 3.0 with TC3-HMAC-SHA256 signing.
pub struct TencentProvider {
    client: Client,
    secret_id: String,
    secret_key: String,
    region_id: String,
}

impl TencentProvider {
    pub fn new(secret_id: &str, secret_key: &str, region_id: &str) -> Result<Self> {
        let region_id = region_id.trim();
        if region_id.is_empty() {
            return Err(anyhow::anyhow!("Tencent region id is empty"));
        }
        Ok(Self {
            client: build_client()?,
            secret_id: secret_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            region_id: region_id.to_string(),
        })
    }

    fn authorization(&self, payload: &str, timestamp: i64) -> String {
        let date = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{}\nhost:{}\n\ncontent-type;host\n{}",
            CONTENT_TYPE,
            CVM_HOST,
            sha256_hex(payload.as_bytes())
        );
        let scope = format!("{}/{}/tc3_request", date, CVM_SERVICE);
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes());
        let secret_service = hmac_sha256(&secret_date, CVM_SERVICE.as_bytes());
        let secret_signing = hmac_sha256(&secret_service, b"tc3_request");
        let signature = hmac_sha256_hex(&secret_signing, string_to_sign.as_bytes());
        format!(
            "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders=content-type;host, Signature={}",
            self.secret_id, scope, signature
        )
    }

    async fn call(&self, action: &str, region_id: &str, body: &Value) -> Result<Value> {
        let payload = serde_json::to_string(body)?;
        let timestamp = Utc::now().timestamp();
        tracing::debug!("[Tencent API] {} region={}", action, region_id);

        let resp = self
            .client
            .post(format!("https://{}/", CVM_HOST))
            .header("Authorization", self.authorization(&payload, timestamp))
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", CVM_HOST)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", CVM_VERSION)
            .header("X-TC-Region", region_id)
            .body(payload)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "Tencent {} failed: status={} body={}",
                action,
                status.as_u16(),
                text
            ));
        }
        let v: Value = serde_json::from_str(&text)?;
        let response = v["Response"].clone();
        // API 3.0 reports failures inside a 200 envelope.
        if let Some(err) = response.get("Error") {
            return Err(anyhow::anyhow!(
                "Tencent {} failed: code={} message={}",
                action,
                str_field(err, "Code").unwrap_or_default(),
                str_field(err, "Message").unwrap_or_default()
            ));
        }
        Ok(response)
    }

    async fn describe(&self, region_id: &str, mut body: Value) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            body["Offset"] = json!(offset);
            body["Limit"] = json!(PAGE_SIZE);
            let resp = self.call("DescribeInstances", region_id, &body).await?;
            let items = resp["InstanceSet"].as_array().cloned().unwrap_or_default();
            let total = resp["TotalCount"].as_u64().unwrap_or(0) as usize;
            let fetched = items.len();
            out.extend(items.iter().map(to_cloud_instance));
            offset += fetched;
            if fetched == 0 || offset >= total {
                break;
            }
        }
        Ok(out)
    }

    async fn instance_action(&self, action: &str, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            self.call(action, &self.region_id, &json!({ "InstanceIds": chunk }))
                .await?;
        }
        Ok(())
    }
}

fn run_instances_body(m: &Params, num: usize) -> Value {
    let mut body = json!({
        "Placement": { "Zone": m.zone },
        "ImageId": m.image_id,
        "InstanceType": m.instance_type,
        "InstanceCount": num,
        "DryRun": m.dry_run,
        "VirtualPrivateCloud": {
            "VpcId": m.network.vpc_id,
            "SubnetId": m.network.subnet_id,
        },
        "TagSpecification": [{
            "ResourceType": "instance",
            "Tags": m.tags.iter().map(|t| json!({"Key": t.key, "Value": t.value})).collect::<Vec<_>>(),
        }],
    });
    if !m.network.security_group.is_empty() {
        body["SecurityGroupIds"] = json!([m.network.security_group]);
    }
    if m.network.internet_max_bandwidth_out > 0 {
        body["InternetAccessible"] = json!({
            "InternetChargeType": m.network.internet_charge_type,
            "InternetMaxBandwidthOut": m.network.internet_max_bandwidth_out,
            "PublicIpAssigned": true,
        });
    }
    if !m.disks.system_disk.category.is_empty() {
        body["SystemDisk"] = json!({
            "DiskType": m.disks.system_disk.category,
            "DiskSize": m.disks.system_disk.size_gb,
        });
    }
    if !m.disks.data_disks.is_empty() {
        body["DataDisks"] = json!(m
            .disks
            .data_disks
            .iter()
            .map(|d| json!({"DiskType": d.category, "DiskSize": d.size_gb}))
            .collect::<Vec<_>>());
    }
    if !m.charge.charge_type.is_empty() {
        body["InstanceChargeType"] = json!(m.charge.charge_type);
        if m.charge.charge_type == "PREPAID" {
            body["InstanceChargePrepaid"] = json!({ "Period": m.charge.period });
        }
    }
    if let Some(key_id) = m.key_pair_id.as_deref().filter(|s| !s.is_empty()) {
        body["LoginSettings"] = json!({ "KeyIds": [key_id] });
    } else if let Some(pw) = m.password.as_deref().filter(|s| !s.is_empty()) {
        body["LoginSettings"] = json!({ "Password": pw });
    }
    body
}

fn first_str(v: &Value) -> Option<String> {
    v.as_array()
        .and_then(|a| a.first())
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
}

fn to_cloud_instance(item: &Value) -> CloudInstance {
    let tags = item["Tags"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| Some(Tag::new(str_field(t, "Key")?, str_field(t, "Value")?)))
                .collect()
        })
        .unwrap_or_default();
    CloudInstance {
        id: str_field(item, "InstanceId").unwrap_or_default(),
        provider: Some(ProviderType::Tencent),
        ip_inner: first_str(&item["PrivateIpAddresses"]),
        ip_outer: first_str(&item["PublicIpAddresses"]),
        image_id: str_field(item, "ImageId"),
        vpc_id: str_field(&item["VirtualPrivateCloud"], "VpcId"),
        subnet_id: str_field(&item["VirtualPrivateCloud"], "SubnetId"),
        status: str_field(item, "InstanceState").unwrap_or_default(),
        charge_type: str_field(item, "InstanceChargeType"),
        tags,
        expire_at: str_field(item, "ExpiredTime")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    }
}

#[async_trait]
impl CloudProvider for TencentProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Tencent
    }

    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>> {
        let body = run_instances_body(params, num);
        match self.call("RunInstances", &params.region, &body).await {
            Ok(_) if params.dry_run => Ok(vec![]),
            Ok(resp) => Ok(resp["InstanceIdSet"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()),
            Err(e) if params.dry_run && e.to_string().contains("code=DryRunOperation") => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    async fn batch_delete(&self, ids: &[String], region_id: &str) -> Result<()> {
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            self.call("TerminateInstances", region_id, &json!({ "InstanceIds": chunk }))
                .await?;
        }
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            out.extend(
                self.describe(&self.region_id, json!({ "InstanceIds": chunk }))
                    .await?,
            );
        }
        Ok(out)
    }

    async fn get_instances_by_tags(
        &self,
        region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        let filters: Vec<Value> = tags
            .iter()
            .map(|t| json!({ "Name": format!("tag:{}", t.key), "Values": [t.value] }))
            .collect();
        let found = self.describe(region_id, json!({ "Filters": filters })).await?;
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
}
