use crate::{has_all_tags, CloudProvider};
use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_ec2::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType, Placement, ResourceType,
    Tag as Ec2Tag, TagSpecification, VolumeType,
};
use aws_sdk_ec2::Client;
use fleet_common::{CloudInstance, Params, ProviderType, Tag};

const MAX_IDS_PER_CALL: usize = 1000;
// Terminated instances stay visible to DescribeInstances for about an hour.
const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// AWS EC2 through the official SDK. Credentials are static per client.
pub struct AwsProvider {
    client: Client,
}

impl AwsProvider {
    pub fn new(access_key: &str, secret_key: &str, region_id: &str) -> Result<Self> {
        let region_id = region_id.trim();
        if region_id.is_empty() {
            return Err(anyhow::anyhow!("AWS region id is empty"));
        }
        let credentials = Credentials::new(
            access_key.trim(),
            secret_key.trim(),
            None,
            None,
            "fleet-registry",
        );
        let config = aws_sdk_ec2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region_id.to_string()))
            .credentials_provider(credentials)
            .build();
        Ok(Self {
            client: Client::from_conf(config),
        })
    }

    async fn describe(
        &self,
        ids: Option<Vec<String>>,
        filters: Vec<Filter>,
    ) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let resp = self
                .client
                .describe_instances()
                .set_instance_ids(ids.clone())
                .set_filters(if filters.is_empty() {
                    None
                } else {
                    Some(filters.clone())
                })
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("AWS DescribeInstances failed: {}", DisplayErrorContext(&e)))?;
            for reservation in resp.reservations() {
                for instance in reservation.instances() {
                    out.push(to_cloud_instance(instance));
                }
            }
            next_token = resp.next_token().map(|s| s.to_string());
            if next_token.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

fn live_state_filter() -> Filter {
    Filter::builder()
        .name("instance-state-name")
        .set_values(Some(LIVE_STATES.iter().map(|s| s.to_string()).collect()))
        .build()
}

fn is_live(instance: &CloudInstance) -> bool {
    LIVE_STATES.contains(&instance.status.as_str())
}

fn to_cloud_instance(instance: &aws_sdk_ec2::types::Instance) -> CloudInstance {
    let tags = instance
        .tags()
        .iter()
        .filter_map(|t| Some(Tag::new(t.key()?, t.value()?)))
        .collect();
    CloudInstance {
        id: instance.instance_id().unwrap_or_default().to_string(),
        provider: Some(ProviderType::Aws),
        ip_inner: instance.private_ip_address().map(|s| s.to_string()),
        ip_outer: instance.public_ip_address().map(|s| s.to_string()),
        image_id: instance.image_id().map(|s| s.to_string()),
        vpc_id: instance.vpc_id().map(|s| s.to_string()),
        subnet_id: instance.subnet_id().map(|s| s.to_string()),
        status: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        charge_type: instance
            .instance_lifecycle()
            .map(|l| l.as_str().to_string()),
        tags,
        // On-demand and spot capacity carry no expiry.
        expire_at: None,
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
    }

    async fn batch_create(&self, m: &Params, num: usize) -> Result<Vec<String>> {
        let count = i32::try_from(num)?;
        let tags: Vec<Ec2Tag> = m
            .tags
            .iter()
            .map(|t| Ec2Tag::builder().key(&t.key).value(&t.value).build())
            .collect();

        let mut req = self
            .client
            .run_instances()
            .image_id(&m.image_id)
            .instance_type(InstanceType::from(m.instance_type.as_str()))
            .min_count(count)
            .max_count(count)
            .dry_run(m.dry_run)
            .placement(Placement::builder().availability_zone(&m.zone).build())
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(tags))
                    .build(),
            );
        if !m.network.subnet_id.is_empty() {
            req = req.subnet_id(&m.network.subnet_id);
        }
        if !m.network.security_group.is_empty() {
            req = req.security_group_ids(&m.network.security_group);
        }
        if let Some(name) = m.key_pair_name.as_deref().filter(|s| !s.is_empty()) {
            req = req.key_name(name);
        }
        if m.disks.system_disk.size_gb > 0 {
            let mut ebs = EbsBlockDevice::builder().volume_size(m.disks.system_disk.size_gb);
            if !m.disks.system_disk.category.is_empty() {
                ebs = ebs.volume_type(VolumeType::from(m.disks.system_disk.category.as_str()));
            }
            req = req.block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/xvda")
                    .ebs(ebs.build())
                    .build(),
            );
        }

        match req.send().await {
            Ok(resp) => Ok(resp
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(|s| s.to_string()))
                .collect()),
            // A passing dry run comes back as a DryRunOperation error.
            Err(e) if m.dry_run && e.code() == Some("DryRunOperation") => Ok(vec![]),
            Err(e) => Err(anyhow::anyhow!(
                "AWS RunInstances failed: {}",
                DisplayErrorContext(&e)
            )),
        }
    }

    async fn batch_delete(&self, ids: &[String], _region_id: &str) -> Result<()> {
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            self.client
                .terminate_instances()
                .set_instance_ids(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("AWS TerminateInstances failed: {}", DisplayErrorContext(&e)))?;
        }
        Ok(())
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<CloudInstance>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.describe(Some(ids.to_vec()), vec![]).await
    }

    async fn get_instances_by_tags(
        &self,
        _region_id: &str,
        tags: &[Tag],
    ) -> Result<Vec<CloudInstance>> {
        let mut filters: Vec<Filter> = tags
            .iter()
            .map(|t| {
                Filter::builder()
                    .name(format!("tag:{}", t.key))
                    .values(&t.value)
                    .build()
            })
            .collect();
        filters.push(live_state_filter());
        let found = self.describe(None, filters).await?;
        Ok(found
            .into_iter()
            .filter(|i| is_live(i) && has_all_tags(&i.tags, tags))
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("AWS StartInstances failed: {}", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("AWS StopInstances failed: {}", DisplayErrorContext(&e)))?;
        Ok(())
    }
}
