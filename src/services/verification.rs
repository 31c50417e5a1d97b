//! 补丁后校验
//!
//! `analyze` 是纯函数；`VerificationService` 负责取数、落盘与多目标汇总。

use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

use super::credential_broker::CredentialBroker;
use crate::cloud::{CommandBackend, MAX_PAGES};
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::audit::{artifact_key, StateRecord, StateScope};
use crate::models::command::round2;
use crate::models::credentials::Credentials;
use crate::models::patch::{IssueDetail, IssueReport, PatchState, Severity, MAX_ISSUE_DETAILS};
use crate::models::steps::{TargetIssueEntry, TargetVerification, VerificationSummary};
use crate::models::target::{Region, Target};
use crate::repository::{BlobStore, RecordStore};
use crate::retry::RetryPolicy;

const POST_ARTIFACT: &str = "post_ec2_patchstates";

/// 按补丁状态分类实例
///
/// 空列表视为 0 个问题实例，成功率 100。
pub fn analyze(states: &[PatchState]) -> IssueReport {
    let total = states.len();
    if total == 0 {
        return IssueReport {
            total_instances: 0,
            healthy_instances: 0,
            problematic_instances: 0,
            failed_instances: 0,
            missing_instances: 0,
            issues: Vec::new(),
            success_rate: 100.0,
            analysis: "No instances found".to_string(),
        };
    }

    let problematic: Vec<&PatchState> = states.iter().filter(|s| s.is_problematic()).collect();
    let failed = problematic
        .iter()
        .filter(|s| s.severity() == Severity::High)
        .count();
    let missing = problematic.len() - failed;
    let healthy = total - problematic.len();

    let analysis = if problematic.is_empty() {
        format!("All {} instances patched successfully", total)
    } else {
        let mut parts = vec![format!("{}/{} instances have issues", problematic.len(), total)];
        if failed > 0 {
            parts.push(format!("{} with failed patches", failed));
        }
        if missing > 0 {
            parts.push(format!("{} with missing patches", missing));
        }
        parts.join("; ")
    };

    let issues = problematic
        .iter()
        .take(MAX_ISSUE_DETAILS)
        .map(|s| IssueDetail {
            instance_id: s.instance_id.clone(),
            missing_count: s.missing_count,
            failed_count: s.failed_count,
            severity: s.severity(),
        })
        .collect();

    IssueReport {
        total_instances: total,
        healthy_instances: healthy,
        problematic_instances: problematic.len(),
        failed_instances: failed,
        missing_instances: missing,
        issues,
        success_rate: round2(healthy as f64 / total as f64 * 100.0),
        analysis,
    }
}

pub struct VerificationService {
    broker: Arc<CredentialBroker>,
    backend: Arc<dyn CommandBackend>,
    retry: RetryPolicy,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    state_ttl_days: i64,
}

impl VerificationService {
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

    /// 读取目标内全部实例的补丁状态（内部翻页）
    pub async fn fetch_patch_states(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        region: &Region,
    ) -> Result<Vec<PatchState>> {
        let mut states = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let token = next_token.take();
            let page = self
                .retry
                .run("describe_instance_patch_states", ctx, |_| {
                    let backend = self.backend.clone();
                    let token = token.clone();
                    let region = region.clone();
                    async move {
                        backend
                            .describe_instance_patch_states(credentials, &region, token)
                            .await
                    }
                })
                .await?;

            states.extend(page.items);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        if next_token.is_some() {
            return Err(AppError::remote("PaginationLimitExceeded", "too many patch state pages"));
        }
        Ok(states)
    }

    /// 校验单个目标并存储制品与 POST 状态记录
    #[instrument(skip(self, ctx, credentials), fields(target = %target, correlation_id = %ctx.correlation_id))]
    pub async fn verify_target(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        target: &Target,
    ) -> Result<(IssueReport, String)> {
        let states = self.fetch_patch_states(ctx, credentials, &target.region).await?;
        let report = analyze(&states);

        let now = Utc::now();
        let key = artifact_key(now.date_naive(), target, POST_ARTIFACT);
        let artifact = serde_json::json!({
            "executionId": ctx.execution_id,
            "accountId": target.account_id,
            "region": target.region,
            "timestamp": now,
            "patchStates": states,
            "analysis": report,
        });
        let location = self.blobs.put_json(&key, &artifact).await?;

        let record = StateRecord::new(
            StateScope::Post,
            target,
            ctx.execution_id.clone(),
            serde_json::json!({
                "artifactKey": key,
                "artifactLocation": location,
                "totalInstances": report.total_instances,
                "problematicInstances": report.problematic_instances,
                "successRate": report.success_rate,
                "analysis": report.analysis,
            }),
            now,
            self.state_ttl_days,
        );
        self.records.put_state(&record).await?;

        tracing::info!(
            total = report.total_instances,
            problematic = report.problematic_instances,
            analysis = %report.analysis,
            "Target verified"
        );
        Ok((report, key))
    }

    /// 多目标校验，单个目标失败不影响其他目标
    #[instrument(skip(self, ctx, targets, external_id), fields(targets = targets.len(), correlation_id = %ctx.correlation_id))]
    pub async fn verify_scope(
        &self,
        ctx: &CorrelationContext,
        targets: &[Target],
        external_id: Option<&str>,
    ) -> VerificationSummary {
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let outcome: Result<(IssueReport, String)> = async {
                let credentials = self
                    .broker
                    .assume_for_account(ctx, &target.account_id, external_id)
                    .await?;
                self.verify_target(ctx, &credentials, target).await
            }
            .await;

            results.push(match outcome {
                Ok((report, key)) => TargetVerification {
                    account_id: target.account_id.to_string(),
                    region: target.region.to_string(),
                    success: true,
                    report: Some(report),
                    artifact_key: Some(key),
                    error: None,
                },
                Err(e) => {
                    tracing::error!(target = %target, error = %e, "Target verification failed");
                    TargetVerification {
                        account_id: target.account_id.to_string(),
                        region: target.region.to_string(),
                        success: false,
                        report: None,
                        artifact_key: None,
                        error: Some(e.to_string()),
                    }
                }
            });
        }

        summarize(ctx.execution_id.clone(), results)
    }
}

fn summarize(execution_id: Option<String>, results: Vec<TargetVerification>) -> VerificationSummary {
    let mut total_instances = 0;
    let mut problematic_instances = 0;
    let mut issues = Vec::new();

    for result in &results {
        if let Some(report) = &result.report {
            total_instances += report.total_instances;
            problematic_instances += report.problematic_instances;
            if report.has_issues() {
                issues.push(TargetIssueEntry {
                    account_id: result.account_id.clone(),
                    region: result.region.clone(),
                    problematic_instances: report.problematic_instances,
                    total_instances: report.total_instances,
                    analysis: report.analysis.clone(),
                });
            }
        }
    }

    let targets_succeeded = results.iter().filter(|r| r.success).count();
    let overall_success_rate = if total_instances == 0 {
        100.0
    } else {
        round2((total_instances - problematic_instances) as f64 / total_instances as f64 * 100.0)
    };

    VerificationSummary {
        execution_id,
        timestamp: Utc::now(),
        targets_succeeded,
        targets_failed: results.len() - targets_succeeded,
        total_instances,
        problematic_instances,
        overall_success_rate,
        has_issues: problematic_instances > 0,
        issues,
        results,
    }
}
