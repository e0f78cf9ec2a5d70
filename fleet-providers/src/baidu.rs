use crate::http::{build_client, json_or_error, str_field};
use crate::signing::{canonical_query, hmac_sha256_hex, percent_encode, percent_encode_path};
use crate::{has_all_tags, CloudProvider};
use aes::Aes128;
use anyhow::Result;
use async_trait::async_trait;
use ecb::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyInit};
use chrono::{DateTime, Utc};
use fleet_common::{CloudInstance, Params, ProviderType, Tag};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashSet;

const SIGNATURE_EXPIRATION_SECS: u32 = 1800;
const PAGE_SIZE: usize = 1000;
const ADMIN_PASS_KEY_LEN: usize = 16;

fn endpoint_suffix(region_id: &str) -> Option<&'static str> {
    match region_id.to_lowercase().as_str() {
        "bj" => Some(".bj.baidubce.com"),
        "gz" => Some(".gz.baidubce.com"),
        "su" => Some(".su.baidubce.com"),
        "hkg" => Some(".hkg.baidubce.com"),
        "fwh" => Some(".fwh.baidubce.com"),
        "bd" => Some(".bd.baidubce.com"),
        _ => None,
    }
}

/// Baidu Cloud BCC over the v2 REST API with bce-auth-v1 signing.
pub struct BaiduProvider {
    client: Client,
    access_key: String,
    secret_key: String,
    host: String,
}

impl BaiduProvider {
    pub fn new(access_key: &str, secret_key: &str, region_id: &str) -> Result<Self> {
        let suffix = endpoint_suffix(region_id.trim())
            .ok_or_else(|| anyhow::anyhow!("regionId error: {}", region_id))?;
        Ok(Self {
            client: build_client()?,
            access_key: access_key.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            host: format!("bcc{}", suffix),
        })
    }

    fn authorization(
        &self,
        method: &Method,
        path: &str,
        query: &[(String, String)],
        bce_date: &str,
    ) -> String {
        let prefix = format!(
            "bce-auth-v1/{}/{}/{}",
            self.access_key, bce_date, SIGNATURE_EXPIRATION_SECS
        );
        let signing_key = hmac_sha256_hex(self.secret_key.as_bytes(), prefix.as_bytes());
        let canonical_headers = format!(
            "host:{}\nx-bce-date:{}",
            percent_encode(&self.host),
            percent_encode(bce_date)
        );
        let canonical_request = format!(
            "{}\n{}\n{}\n{}",
            method.as_str(),
            percent_encode_path(path),
            canonical_query(query),
            canonical_headers
        );
        let signature = hmac_sha256_hex(signing_key.as_bytes(), canonical_request.as_bytes());
        format!("{}/host;x-bce-date/{}", prefix, signature)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let bce_date = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let authorization = self.authorization(&method, path, &query, &bce_date);
        let action = format!("{} {}", method, path);
        tracing::debug!("[Baidu API] {} host={}", action, self.host);

        let mut req = self
            .client
            .request(method, format!("https://{}{}", self.host, path))
            .query(&query)
            .header("Host", &self.host)
            .header("x-bce-date", bce_date)
            .header("Authorization", authorization);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        json_or_error("Baidu", &action, resp).await
    }

    async fn list_all(&self) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut query = vec![("maxKeys".to_string(), PAGE_SIZE.to_string())];
            if let Some(m) = &marker {
                query.push(("marker".to_string(), m.clone()));
            }
            let body = self.request(Method::GET, "/v2/instance", query, None).await?;
            let items = body["instances"].as_array().cloned().unwrap_or_default();
            out.extend(items.iter().map(to_cloud_instance));
            marker = str_field(&body, "nextMarker");
            if !body["isTruncated"].as_bool().unwrap_or(false) || marker.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

/// BCC only accepts `adminPass` as AES-128-ECB ciphertext (PKCS7, hex),
/// keyed by the first 16 bytes of the account's secret key.
fn encrypt_admin_pass(secret_key: &str, password: &str) -> Result<String> {
    let key = secret_key
        .as_bytes()
        .get(..ADMIN_PASS_KEY_LEN)
        .ok_or_else(|| anyhow::anyhow!("Baidu secret key too short to encrypt adminPass"))?;
    let cipher = ecb::Encryptor::<Aes128>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Baidu adminPass cipher: {}", e))?;
    Ok(hex::encode(
        cipher.encrypt_padded_vec_mut::<Pkcs7>(password.as_bytes()),
    ))
}

fn validate(m: &Params) -> Result<()> {
    let missing: Vec<&str> = [
        ("imageId", m.image_id.as_str()),
        ("spec", m.instance_type.as_str()),
        ("zoneName", m.zone.as_str()),
    ]
    .into_iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(k, _)| k)
    .collect();
    if !missing.is_empty() {
        return Err(anyhow::anyhow!("Baidu create params missing: {}", missing.join(", ")));
    }
    let has_key_pair = m.key_pair_id.as_deref().is_some_and(|s| !s.is_empty());
    let has_password = m.password.as_deref().is_some_and(|s| !s.is_empty());
    if !has_key_pair && !has_password {
        return Err(anyhow::anyhow!(
            "Baidu instances need a key pair or an admin password"
        ));
    }
    Ok(())
}

fn create_body(m: &Params, num: usize, admin_pass: Option<String>) -> Value {
    let payment = if m.charge.charge_type.is_empty() {
        "Postpaid"
    } else {
        m.charge.charge_type.as_str()
    };
    let mut billing = json!({ "paymentTiming": payment });
    if payment == "Prepaid" {
        billing["reservation"] = json!({
            "reservationLength": m.charge.period,
            "reservationTimeUnit": m.charge.period_unit,
        });
    }
    let mut body = json!({
        "imageId": m.image_id,
        "spec": m.instance_type,
        "zoneName": m.zone,
        "purchaseCount": num,
        "billing": billing,
        "rootDiskSizeInGb": m.disks.system_disk.size_gb,
        "rootDiskStorageType": m.disks.system_disk.category,
        "createCdsList": m.disks.data_disks.iter()
            .map(|d| json!({"storageType": d.category, "cdsSizeInGB": d.size_gb}))
            .collect::<Vec<_>>(),
        "networkCapacityInMbps": m.network.internet_max_bandwidth_out,
        "internetChargeType": m.network.internet_charge_type,
        "subnetId": m.network.subnet_id,
        "securityGroupId": m.network.security_group,
        "keypairId": m.key_pair_id,
        "tags": m.tags.iter()
            .map(|t| json!({"tagKey": t.key, "tagValue": t.value}))
            .collect::<Vec<_>>(),
    });
    if let Some(pass) = admin_pass {
        body["adminPass"] = json!(pass);
    }
    body
}

fn to_cloud_instance(item: &Value) -> CloudInstance {
    let tags = item["tags"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| Some(Tag::new(str_field(t, "tagKey")?, str_field(t, "tagValue")?)))
                .collect()
        })
        .unwrap_or_default();
    CloudInstance {
        id: str_field(item, "id").unwrap_or_default(),
        provider: Some(ProviderType::Baidu),
        ip_inner: str_field(item, "internalIp"),
        ip_outer: str_field(item, "publicIp"),
        image_id: str_field(item, "imageId"),
        vpc_id: str_field(item, "vpcId"),
        subnet_id: str_field(item, "subnetId"),
        status: str_field(item, "status").unwrap_or_default(),
        charge_type: str_field(item, "paymentTiming"),
        tags,
        expire_at: str_field(item, "expireTime")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    }
}

#[async_trait]
impl CloudProvider for BaiduProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Baidu
    }

    async fn batch_create(&self, params: &Params, num: usize) -> Result<Vec<String>> {
        validate(params)?;
        // Key pair login wins when both are configured.
        let admin_pass = match (params.key_pair_id.as_deref(), params.password.as_deref()) {
            (Some(k), _) if !k.is_empty() => None,
            (_, Some(pw)) => Some(encrypt_admin_pass(&self.secret_key, pw)?),
            _ => None,
        };
        // BCC has no dry-run switch: local validation is all a dry run does.
        if params.dry_run {
            return Ok(vec![]);
        }
        let query = vec![("clientToken".to_string(), uuid::Uuid::new_v4().to_string())];
        let body = self
            .request(
                Method::POST,
                "/v2/instance",
                query,
                Some(&create_body(params, num, admin_pass)),
            )
            .await?;
        Ok(body["instanceIds"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_delete(&self, ids: &[String], _region_id: &str) -> Result<()> {
        for id in ids {
            self.request(Method::DELETE, &format!("/v2/instance/{}", id), vec![], None)
                .await?;
        }
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|i| wanted.contains(i.id.as_str()))
            .collect())
    }

    async fn get_instances_by_tags(
        &self,
        _region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|i| has_all_tags(&i.tags, tags))
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            let query = vec![("start".to_string(), String::new())];
            self.request(Method::PUT, &format!("/v2/instance/{}", id), query, None)
                .await?;
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            let query = vec![("stop".to_string(), String::new())];
            self.request(
                Method::PUT,
                &format!("/v2/instance/{}", id),
                query,
                Some(&json!({ "forceStop": false })),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{ChargeConfig, NetworkConfig, StorageConfig};

    fn params() -> Params {
        Params {
            provider: ProviderType::Baidu,
            region: "bj".into(),
            zone: "cn-bj-a".into(),
            instance_type: "bcc.g4.c2m8".into(),
            image_id: "m-1".into(),
            network: NetworkConfig::default(),
            disks: StorageConfig::default(),
            charge: ChargeConfig::default(),
            password: None,
            key_pair_id: Some("k-1".into()),
            key_pair_name: None,
            tags: vec![Tag::new("TaskId", "3")],
            dry_run: true,
        }
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert!(BaiduProvider::new("ak", "sk", "mars").is_err());
        assert!(BaiduProvider::new("ak", "sk", "BJ").is_ok());
    }

    #[tokio::test]
    async fn dry_run_only_validates_locally() {
        let p = BaiduProvider::new("ak", "sk", "bj").unwrap();
        assert_eq!(p.batch_create(&params(), 2).await.unwrap(), Vec::<String>::new());

        let mut bad = params();
        bad.image_id.clear();
        let err = p.batch_create(&bad, 2).await.unwrap_err();
        assert!(err.to_string().contains("imageId"));

        let mut pw = params();
        pw.key_pair_id = None;
        pw.password = Some("pw".into());
        // "sk" cannot key AES-128.
        assert!(p.batch_create(&pw, 1).await.is_err());
        let real = BaiduProvider::new("ak", "0123456789abcdef0123456789abcdef", "bj").unwrap();
        assert!(real.batch_create(&pw, 1).await.is_ok());

        pw.password = None;
        let err = p.batch_create(&pw, 1).await.unwrap_err();
        assert!(err.to_string().contains("key pair or an admin password"));
    }

    #[test]
    fn admin_pass_is_aes_ecb_hex() {
        let sk = "0123456789abcdef0123456789abcdef";
        let encrypted = encrypt_admin_pass(sk, "Passw0rd!").unwrap();
        assert_eq!(encrypted, "2a71397f8c035255981a317d5b4ebd8d");

        use ecb::cipher::BlockDecryptMut;
        let plain = ecb::Decryptor::<Aes128>::new_from_slice(&sk.as_bytes()[..16])
            .unwrap()
            .decrypt_padded_vec_mut::<Pkcs7>(&hex::decode(&encrypted).unwrap())
            .unwrap();
        assert_eq!(plain, b"Passw0rd!");

        assert!(encrypt_admin_pass("short", "pw").is_err());
    }

    #[test]
    fn create_body_carries_encrypted_password_only_when_given() {
        let body = create_body(&params(), 1, Some("cafe".into()));
        assert_eq!(body["adminPass"], "cafe");
        assert!(create_body(&params(), 1, None).get("adminPass").is_none());
    }

    #[test]
    fn create_body_defaults_to_postpaid() {
        let body = create_body(&params(), 5, None);
        assert_eq!(body["purchaseCount"], 5);
        assert_eq!(body["billing"]["paymentTiming"], "Postpaid");
        assert!(body["billing"].get("reservation").is_none());
        assert_eq!(body["tags"][0]["tagValue"], "3");
    }

    #[test]
    fn authorization_layout() {
        let p = BaiduProvider::new("ak", "sk", "bj").unwrap();
        let auth = p.authorization(&Method::GET, "/v2/instance", &[], "2024-01-01T00:00:00Z");
        let parts: Vec<&str> = auth.split('/').collect();
        assert_eq!(&parts[..4], &["bce-auth-v1", "ak", "2024-01-01T00:00:00Z", "1800"]);
        assert_eq!(parts[4], "host;x-bce-date");
        assert_eq!(parts[5].len(), 64);
    }
}
