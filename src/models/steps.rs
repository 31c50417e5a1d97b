//! 步骤请求/响应契约
//!
//! 每个步骤都有显式的请求与响应类型，在边界处完成校验。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use validator::Validate;

use super::command::{OutputLocation, PollResult, TargetFilter};
use super::patch::IssueReport;
use super::target::{AccountId, Region, Target};
use crate::error::{AppError, Result};

// ==================== 下发 ====================

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStepRequest {
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
    pub region: Option<String>,
    pub document_name: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetFilter>,
    pub max_concurrency: Option<String>,
    pub max_errors: Option<String>,
    pub parameters: Option<HashMap<String, Vec<String>>>,
    pub output_location: Option<OutputLocation>,
    #[validate(length(min = 1, max = 128))]
    pub execution_id: Option<String>,
    /// 波次序号，参与幂等令牌计算
    pub wave: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStepResponse {
    pub command_id: String,
    pub region: String,
    pub account_id: String,
}

// ==================== 轮询 ====================

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PollStepRequest {
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
    pub region: Option<String>,
    #[validate(length(min = 1))]
    pub command_id: Option<String>,
    pub account_id: Option<String>,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStepResponse {
    #[serde(flatten)]
    pub result: PollResult,
    pub command_id: String,
    pub region: String,
    pub account_id: String,
    pub execution_id: Option<String>,
}

// ==================== 盘点 / 校验 ====================

/// 盘点与校验步骤共用的范围输入
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRequest {
    #[validate(length(min = 1, message = "accounts is required"))]
    #[serde(default)]
    pub accounts: Vec<String>,
    #[validate(length(min = 1, message = "regions is required"))]
    #[serde(default)]
    pub regions: Vec<String>,
    pub execution_id: Option<String>,
    pub external_id: Option<String>,
}

impl ScopeRequest {
    /// 校验并展开为目标列表，任何格式错误都在远程调用前失败
    pub fn targets(&self) -> Result<Vec<Target>> {
        self.validate()?;

        let accounts = self
            .accounts
            .iter()
            .map(|a| AccountId::parse(a))
            .collect::<Result<Vec<_>>>()?;
        let regions = self
            .regions
            .iter()
            .map(|r| Region::parse(r))
            .collect::<Result<Vec<_>>>()?;

        Ok(Target::cross(&accounts, &regions))
    }
}

/// 单目标校验结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetVerification {
    pub account_id: String,
    pub region: String,
    pub success: bool,
    pub report: Option<IssueReport>,
    pub artifact_key: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetIssueEntry {
    pub account_id: String,
    pub region: String,
    pub problematic_instances: usize,
    pub total_instances: usize,
    pub analysis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub targets_succeeded: usize,
    pub targets_failed: usize,
    pub total_instances: usize,
    pub problematic_instances: usize,
    pub overall_success_rate: f64,
    pub has_issues: bool,
    pub issues: Vec<TargetIssueEntry>,
    pub results: Vec<TargetVerification>,
}

/// 单目标盘点结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInventory {
    pub account_id: String,
    pub region: String,
    pub success: bool,
    pub instance_count: usize,
    pub platforms: BTreeMap<String, usize>,
    pub ping_status: BTreeMap<String, usize>,
    pub artifact_key: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub targets_succeeded: usize,
    pub targets_failed: usize,
    pub total_instances: usize,
    pub results: Vec<TargetInventory>,
}

// ==================== 审批 ====================

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStepRequest {
    #[validate(length(min = 1, message = "continuationToken is required"))]
    #[serde(default)]
    pub continuation_token: String,
    pub subject: Option<String>,
    pub details: Option<String>,
    pub execution_id: Option<String>,
    #[validate(range(min = 1, max = 1440))]
    pub estimated_duration_minutes: Option<u32>,
}

/// 只暴露链接长度，签名链接本身不出现在输出和日志中
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStepResponse {
    pub status: String,
    pub execution_id: String,
    pub token_hash: String,
    pub approve_url_length: usize,
    pub reject_url_length: usize,
    pub notification_id: Option<String>,
    pub expires_in_minutes: u64,
}

// ==================== 失败结果 ====================

/// 步骤失败时返回给工作流引擎的结构化结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub status_code: u16,
    pub success: bool,
    pub error: String,
    pub error_type: String,
}

impl From<&AppError> for StepFailure {
    fn from(e: &AppError) -> Self {
        Self {
            status_code: e.status_code().as_u16(),
            success: false,
            error: e.user_message(),
            error_type: e.error_type().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_requires_accounts_and_regions() {
        let req = ScopeRequest {
            accounts: vec![],
            regions: vec!["us-east-1".into()],
            ..Default::default()
        };
        assert!(matches!(req.targets(), Err(AppError::Validation(_))));

        let req = ScopeRequest {
            accounts: vec!["123456789012".into()],
            regions: vec![],
            ..Default::default()
        };
        assert!(matches!(req.targets(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_scope_rejects_malformed_values() {
        let req = ScopeRequest {
            accounts: vec!["123456789012".into(), "12345".into()],
            regions: vec!["us-east-1".into()],
            ..Default::default()
        };
        assert!(matches!(req.targets(), Err(AppError::Validation(_))));

        let req = ScopeRequest {
            accounts: vec!["123456789012".into()],
            regions: vec!["us-e".into()],
            ..Default::default()
        };
        assert!(matches!(req.targets(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_scope_expands_targets() {
        let req = ScopeRequest {
            accounts: vec!["123456789012".into(), "210987654321".into()],
            regions: vec!["us-east-1".into()],
            ..Default::default()
        };
        let targets = req.targets().unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_dispatch_request_accepts_pascal_case_filters() {
        let req: DispatchStepRequest = serde_json::from_str(
            r#"{"roleArn":"arn:aws:iam::123456789012:role/PatchExecRole","region":"us-east-1",
               "targets":[{"Key":"tag:PatchGroup","Values":["prod"]}]}"#,
        )
        .unwrap();
        assert_eq!(req.targets[0].key, "tag:PatchGroup");
        assert!(req.document_name.is_none());
    }

    #[test]
    fn test_step_failure_from_error() {
        let failure = StepFailure::from(&AppError::validation("roleArn and region are required"));
        assert_eq!(failure.status_code, 400);
        assert!(!failure.success);
        assert_eq!(failure.error_type, "ValidationError");
    }
}
