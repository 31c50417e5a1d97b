//! 补丁状态与问题报告模型

use serde::{Deserialize, Serialize};

/// 每个目标最多输出的问题实例明细条数
pub const MAX_ISSUE_DETAILS: usize = 10;

/// 单实例补丁合规快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchState {
    pub instance_id: String,
    #[serde(default)]
    pub missing_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub installed_count: u32,
    #[serde(default)]
    pub installed_pending_reboot_count: u32,
    #[serde(default)]
    pub operation: Option<String>,
}

impl PatchState {
    pub fn is_problematic(&self) -> bool {
        self.missing_count > 0 || self.failed_count > 0
    }

    pub fn severity(&self) -> Severity {
        if self.failed_count > 0 {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueDetail {
    pub instance_id: String,
    pub missing_count: u32,
    pub failed_count: u32,
    pub severity: Severity,
}

/// 单目标问题报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueReport {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub problematic_instances: usize,
    pub failed_instances: usize,
    pub missing_instances: usize,
    /// 最多 MAX_ISSUE_DETAILS 条
    pub issues: Vec<IssueDetail>,
    pub success_rate: f64,
    pub analysis: String,
}

impl IssueReport {
    pub fn has_issues(&self) -> bool {
        self.problematic_instances > 0
    }
}

/// 托管实例信息（补丁前盘点）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub instance_id: String,
    pub ping_status: String,
    #[serde(default)]
    pub platform_type: Option<String>,
    #[serde(default)]
    pub platform_name: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
}
