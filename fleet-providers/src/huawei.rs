use crate::http::{build_client, json_or_error, json_or_missing, str_field};
use crate::signing::{canonical_query, hmac_sha256_hex, percent_encode_path, sha256_hex};
use crate::{has_all_tags, CloudProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{CloudInstance, Params, ProviderType, Tag};
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

const IAM_HOST: &str = "iam.myhuaweicloud.com";
const PAGE_SIZE: usize = 100;
const MAX_IDS_PER_DELETE: usize = 1000;

/// Huawei Cloud ECS over the REST API with SDK-HMAC-SHA256 signing.
pub struct HuaweiProvider {
    client: Client,
    access_key: String,
    secret_key: String,
    region_id: String,
    // Resolved from IAM on first use; construction stays offline.
    project_id: OnceCell<String>,
}

struct SignedRequest {
    authorization: String,
    sdk_date: String,
}

impl HuaweiProvider {
    pub fn new(access_key: &str, secret_key: &str, region_id: &str) -> Result<Self> {
        let region_id = region_id.trim();
        if region_id.is_empty() {
            return Err(anyhow::anyhow!("Huawei region id is empty"));
        }
        Ok(Self {
            client: build_client()?,
            access_key: access_key.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            region_id: region_id.to_string(),
            project_id: OnceCell::new(),
        })
    }

    fn ecs_host(&self) -> String {
        format!("ecs.{}.myhuaweicloud.com", self.region_id)
    }

    fn sign(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        query: &[(String, String)],
        body: &str,
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let sdk_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let mut uri = percent_encode_path(path);
        if !uri.ends_with('/') {
            uri.push('/');
        }
        let canonical_request = format!(
            "{}\n{}\n{}\ncontent-type:application/json\nhost:{}\nx-sdk-date:{}\n\ncontent-type;host;x-sdk-date\n{}",
            method.as_str(),
            uri,
            canonical_query(query),
            host,
            sdk_date,
            sha256_hex(body.as_bytes())
        );
        let string_to_sign = format!(
            "SDK-HMAC-SHA256\n{}\n{}",
            sdk_date,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hmac_sha256_hex(self.secret_key.as_bytes(), string_to_sign.as_bytes());
        SignedRequest {
            authorization: format!(
                "SDK-HMAC-SHA256 Access={}, SignedHeaders=content-type;host;x-sdk-date, Signature={}",
                self.access_key, signature
            ),
            sdk_date,
        }
    }

    async fn request(
        &self,
        method: Method,
        host: &str,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let action = format!("{} {}", method, path);
        let resp = self.send(method, host, path, query, body).await?;
        json_or_error("Huawei", &action, resp).await
    }

    async fn send(
        &self,
        method: Method,
        host: &str,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<&Value>,
    ) -> Result<Response> {
        let payload = match body {
            Some(b) => serde_json::to_string(b)?,
            None => String::new(),
        };
        let signed = self.sign(&method, host, path, &query, &payload, Utc::now());
        let action = format!("{} {}", method, path);
        tracing::debug!("[Huawei API] {} host={}", action, host);

        Ok(self
            .client
            .request(method, format!("https://{}{}", host, path))
            .query(&query)
            .header("Content-Type", "application/json")
            .header("Host", host)
            .header("X-Sdk-Date", signed.sdk_date)
            .header("Authorization", signed.authorization)
            .body(payload)
            .send()
            .await?)
    }

    async fn project_id(&self) -> Result<&str> {
        let id = self
            .project_id
            .get_or_try_init(|| async {
                let body = self
                    .request(
                        Method::GET,
                        IAM_HOST,
                        "/v3/projects",
                        vec![("name".to_string(), self.region_id.clone())],
                        None,
                    )
                    .await?;
                body["projects"]
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|p| str_field(p, "id"))
                    .with_context(|| format!("no Huawei project for region {}", self.region_id))
            })
            .await?;
        Ok(id.as_str())
    }

    async fn list(&self, query: Vec<(String, String)>) -> Result<Vec<CloudInstance>> {
        let path = format!("/v1/{}/cloudservers/detail", self.project_id().await?);
        let host = self.ecs_host();
        let mut out = Vec::new();
        // `offset` is a 1-based page number on this API.
        let mut page = 1usize;
        loop {
            let mut q = query.clone();
            q.push(("limit".into(), PAGE_SIZE.to_string()));
            q.push(("offset".into(), page.to_string()));
            let body = self.request(Method::GET, &host, &path, q, None).await?;
            let servers = body["servers"].as_array().cloned().unwrap_or_default();
            let total = body["count"].as_u64().unwrap_or(0) as usize;
            let fetched = servers.len();
            out.extend(servers.iter().map(to_cloud_instance));
            if fetched == 0 || out.len() >= total {
                break;
            }
            page += 1;
        }
        Ok(out)
    }
}

fn create_body(m: &Params, num: usize) -> Value {
    let mut server = json!({
        "imageRef": m.image_id,
        "flavorRef": m.instance_type,
        "name": format!("fleet-{}", m.tag(fleet_common::TAG_CLUSTER_NAME).unwrap_or("node")),
        "vpcid": m.network.vpc_id,
        "nics": [{ "subnet_id": m.network.subnet_id }],
        "availability_zone": m.zone,
        "count": num,
        "root_volume": {
            "volumetype": m.disks.system_disk.category,
            "size": m.disks.system_disk.size_gb,
        },
        "server_tags": m.tags.iter().map(|t| json!({"key": t.key, "value": t.value})).collect::<Vec<_>>(),
    });
    if !m.network.security_group.is_empty() {
        server["security_groups"] = json!([{ "id": m.network.security_group }]);
    }
    if !m.disks.data_disks.is_empty() {
        server["data_volumes"] = json!(m
            .disks
            .data_disks
            .iter()
            .map(|d| json!({"volumetype": d.category, "size": d.size_gb}))
            .collect::<Vec<_>>());
    }
    if m.network.internet_max_bandwidth_out > 0 {
        let ip_type = if m.network.internet_ip_type.is_empty() {
            "5_bgp"
        } else {
            m.network.internet_ip_type.as_str()
        };
        server["publicip"] = json!({
            "eip": {
                "iptype": ip_type,
                "bandwidth": {
                    "size": m.network.internet_max_bandwidth_out,
                    "sharetype": "PER",
                    "chargemode": m.network.internet_charge_type,
                }
            }
        });
    }
    if m.charge.charge_type == "prePaid" {
        server["extendparam"] = json!({
            "chargingMode": "prePaid",
            "periodType": m.charge.period_unit,
            "periodNum": m.charge.period,
            "isAutoPay": "true",
        });
    }
    if let Some(name) = m.key_pair_name.as_deref().filter(|s| !s.is_empty()) {
        server["key_name"] = json!(name);
    } else if let Some(pw) = m.password.as_deref().filter(|s| !s.is_empty()) {
        server["adminPass"] = json!(pw);
    }
    json!({ "server": server, "dry_run": m.dry_run })
}

fn address_of(item: &Value, kind: &str) -> Option<String> {
    item["addresses"].as_object()?.values().find_map(|nets| {
        nets.as_array()?
            .iter()
            .find(|a| a["OS-EXT-IPS:type"].as_str() == Some(kind))
            .and_then(|a| str_field(a, "addr"))
    })
}

fn to_cloud_instance(item: &Value) -> CloudInstance {
    // Detail listings report tags as "key=value" strings.
    let tags = item["tags"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str())
                .filter_map(|t| t.split_once('='))
                .map(|(k, v)| Tag::new(k, v))
                .collect()
        })
        .unwrap_or_default();
    CloudInstance {
        id: str_field(item, "id").unwrap_or_default(),
        provider: Some(ProviderType::Huawei),
        ip_inner: address_of(item, "fixed"),
        ip_outer: address_of(item, "floating"),
        image_id: str_field(&item["image"], "id"),
        vpc_id: str_field(&item["metadata"], "vpc_id"),
        subnet_id: None,
        status: str_field(item, "status").unwrap_or_default(),
        charge_type: str_field(&item["metadata"], "charging_mode"),
        tags,
        expire_at: None,
    }
}

#[async_trait]
impl CloudProvider for HuaweiProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Huawei
    }

    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>> {
        let path = format!("/v1/{}/cloudservers", self.project_id().await?);
        let body = self
            .request(
                Method::POST,
                &self.ecs_host(),
                &path,
                vec![],
                Some(&create_body(params, num)),
            )
            .await?;
        if params.dry_run {
            return Ok(vec![]);
        }
        Ok(body["serverIds"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_delete(&self, ids: &[String], _region_id: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!("/v1/{}/cloudservers/delete", self.project_id().await?);
        for chunk in ids.chunks(MAX_IDS_PER_DELETE) {
            let body = json!({
                "servers": chunk.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
                "delete_publicip": true,
                "delete_volume": true,
            });
            self.request(Method::POST, &self.ecs_host(), &path, vec![], Some(&body))
                .await?;
        }
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        let project_id = self.project_id().await?.to_string();
        let host = self.ecs_host();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let path = format!("/v1/{}/cloudservers/{}", project_id, id);
            let resp = self.send(Method::GET, &host, &path, vec![], None).await?;
            // Deleted servers answer 404; they are simply not returned.
            if let Some(body) = json_or_missing("Huawei", &format!("GET {}", path), resp).await? {
                out.push(to_cloud_instance(&body["server"]));
            }
        }
        Ok(out)
    }

    async fn get_instances_by_tags(
        &self,
        _region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        let query = tags
            .iter()
            .map(|t| ("tags".to_string(), format!("{}*{}", t.key, t.value)))
            .collect();
        let found = self.list(query).await?;
        Ok(found
            .into_iter()
            .filter(|i| has_all_tags(&i.tags, tags))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_common::{ChargeConfig, NetworkConfig, StorageConfig};

    #[test]
    fn create_body_uses_key_pair_and_eip() {
        let params = Params {
            provider: ProviderType::Huawei,
            region: "cn-north-4".into(),
            zone: "cn-north-4a".into(),
            instance_type: "s6.small.1".into(),
            image_id: "img".into(),
            network: NetworkConfig {
                vpc_id: "vpc".into(),
                subnet_id: "subnet".into(),
                security_group: "sg".into(),
                internet_charge_type: "traffic".into(),
                internet_max_bandwidth_out: 10,
                internet_ip_type: String::new(),
            },
            disks: StorageConfig::default(),
            charge: ChargeConfig::default(),
            password: Some("pw".into()),
            key_pair_id: None,
            key_pair_name: Some("kp".into()),
            tags: vec![Tag::new("ClusterName", "web")],
            dry_run: false,
        };
        let body = create_body(&params, 4);
        assert_eq!(body["server"]["count"], 4);
        assert_eq!(body["server"]["name"], "fleet-web");
        assert_eq!(body["server"]["key_name"], "kp");
        assert!(body["server"].get("adminPass").is_none());
        assert_eq!(body["server"]["publicip"]["eip"]["iptype"], "5_bgp");
        assert_eq!(body["server"]["server_tags"][0]["value"], "web");
        assert_eq!(body["dry_run"], false);
    }

    #[test]
    fn signed_request_is_stable() {
        let p = HuaweiProvider::new("ak", "sk", "cn-north-4").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let a = p.sign(&Method::GET, "ecs.cn-north-4.myhuaweicloud.com", "/v1/p/cloudservers/detail", &[], "", now);
        let b = p.sign(&Method::GET, "ecs.cn-north-4.myhuaweicloud.com", "/v1/p/cloudservers/detail", &[], "", now);
        assert_eq!(a.sdk_date, "20240506T070809Z");
        assert_eq!(a.authorization, b.authorization);
        assert!(a
            .authorization
            .starts_with("SDK-HMAC-SHA256 Access=ak, SignedHeaders=content-type;host;x-sdk-date, Signature="));
    }

    #[test]
    fn detail_item_maps_addresses_and_tags() {
        let item = json!({
            "id": "srv-1",
            "status": "ACTIVE",
            "image": {"id": "img"},
            "metadata": {"vpc_id": "vpc", "charging_mode": "0"},
            "addresses": {"vpc": [
                {"addr": "192.168.0.4", "OS-EXT-IPS:type": "fixed"},
                {"addr": "121.0.0.9", "OS-EXT-IPS:type": "floating"}
            ]},
            "tags": ["TaskId=5", "ClusterName=web"]
        });
        let inst = to_cloud_instance(&item);
        assert_eq!(inst.ip_inner.as_deref(), Some("192.168.0.4"));
        assert_eq!(inst.ip_outer.as_deref(), Some("121.0.0.9"));
        assert!(has_all_tags(&inst.tags, &[Tag::new("TaskId", "5")]));
    }
}
