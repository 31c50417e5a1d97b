//! 补丁前实例盘点

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use super::credential_broker::CredentialBroker;
use crate::cloud::{CommandBackend, MAX_PAGES};
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::audit::{artifact_key, StateRecord, StateScope};
use crate::models::credentials::Credentials;
use crate::models::patch::InstanceInfo;
use crate::models::steps::{InventorySummary, TargetInventory};
use crate::models::target::Target;
use crate::repository::{BlobStore, RecordStore};
use crate::retry::RetryPolicy;

const PRE_ARTIFACT: &str = "pre_ec2";
/// 只盘点在线或失联的托管实例
const TRACKED_PING_STATUS: &[&str] = &["Online", "ConnectionLost"];
const MAX_INSTANCES: usize = 10_000;

pub struct InventoryService {
    broker: Arc<CredentialBroker>,
    backend: Arc<dyn CommandBackend>,
    retry: RetryPolicy,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    state_ttl_days: i64,
}

impl InventoryService {
    pub fn new(
        broker: Arc<CredentialBroker>,
        backend: Arc<dyn CommandBackend>,
        retry: RetryPolicy,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        state_ttl_days: i64,
    ) -> Self {
        Self {
            broker,
            backend,
            retry,
            blobs,
            records,
            state_ttl_days,
        }
    }

    async fn list_instances(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        target: &Target,
    ) -> Result<Vec<InstanceInfo>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let token = next_token.take();
            let page = self
                .retry
                .run("describe_instance_information", ctx, |_| {
                    let backend = self.backend.clone();
                    let token = token.clone();
                    let region = target.region.clone();
                    async move {
                        backend
                            .describe_instance_information(credentials, &region, token)
                            .await
                    }
                })
                .await?;

            instances.extend(
                page.items
                    .into_iter()
                    .filter(|i| TRACKED_PING_STATUS.contains(&i.ping_status.as_str())),
            );
            if instances.len() >= MAX_INSTANCES {
                tracing::warn!(target = %target, count = instances.len(), "Instance limit reached, truncating inventory");
                instances.truncate(MAX_INSTANCES);
                break;
            }
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        if next_token.is_some() {
            return Err(AppError::remote("PaginationLimitExceeded", "too many instance pages"));
        }
        Ok(instances)
    }

    /// 盘点单个目标并存储 `pre_ec2.json` 与 PRE 状态记录
    #[instrument(skip(self, ctx, credentials), fields(target = %target, correlation_id = %ctx.correlation_id))]
    pub async fn collect_target(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        target: &Target,
    ) -> Result<TargetInventory> {
        let instances = self.list_instances(ctx, credentials, target).await?;

        let mut platforms: BTreeMap<String, usize> = BTreeMap::new();
        let mut ping_status: BTreeMap<String, usize> = BTreeMap::new();
        for instance in &instances {
            let platform = instance.platform_type.clone().unwrap_or_else(|| "Unknown".to_string());
            *platforms.entry(platform).or_default() += 1;
            *ping_status.entry(instance.ping_status.clone()).or_default() += 1;
        }

        let now = Utc::now();
        let key = artifact_key(now.date_naive(), target, PRE_ARTIFACT);
        let artifact = serde_json::json!({
            "executionId": ctx.execution_id,
            "accountId": target.account_id,
            "region": target.region,
            "collectedAt": now,
            "instances": instances,
            "summary": {
                "totalInstances": instances.len(),
                "platformDistribution": platforms,
                "pingStatusDistribution": ping_status,
            },
        });
        let location = self.blobs.put_json(&key, &artifact).await?;

        let record = StateRecord::new(
            StateScope::Pre,
            target,
            ctx.execution_id.clone(),
            serde_json::json!({
                "status": "completed",
                "instanceCount": instances.len(),
                "artifactKey": key,
                "artifactLocation": location,
                "correlationId": ctx.correlation_id,
            }),
            now,
            self.state_ttl_days,
        );
        self.records.put_state(&record).await?;

        tracing::info!(instances = instances.len(), "Inventory collected");
        Ok(TargetInventory {
            account_id: target.account_id.to_string(),
            region: target.region.to_string(),
            success: true,
            instance_count: instances.len(),
            platforms,
            ping_status,
            artifact_key: Some(key),
            error: None,
        })
    }

    /// 多目标盘点，单个目标失败被记录后继续
    #[instrument(skip(self, ctx, targets, external_id), fields(targets = targets.len(), correlation_id = %ctx.correlation_id))]
    pub async fn collect(
        &self,
        ctx: &CorrelationContext,
        targets: &[Target],
        external_id: Option<&str>,
    ) -> InventorySummary {
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let outcome: Result<TargetInventory> = async {
                let credentials = self
                    .broker
                    .assume_for_account(ctx, &target.account_id, external_id)
                    .await?;
                self.collect_target(ctx, &credentials, target).await
            }
            .await;

            results.push(outcome.unwrap_or_else(|e| {
                tracing::error!(target = %target, error = %e, "Inventory failed");
                TargetInventory {
                    account_id: target.account_id.to_string(),
                    region: target.region.to_string(),
                    success: false,
                    instance_count: 0,
                    platforms: BTreeMap::new(),
                    ping_status: BTreeMap::new(),
                    artifact_key: None,
                    error: Some(e.to_string()),
                }
            }));
        }

        let targets_succeeded = results.iter().filter(|r| r.success).count();
        InventorySummary {
            execution_id: ctx.execution_id.clone(),
            timestamp: Utc::now(),
            targets_succeeded,
            targets_failed: results.len() - targets_succeeded,
            total_instances: results.iter().map(|r| r.instance_count).sum(),
            results,
        }
    }
}
