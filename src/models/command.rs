//! 远程命令与调用状态模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 失败率超过该百分比时标记为 HIGH_FAILURE_RATE
pub const HIGH_FAILURE_RATE_THRESHOLD: f64 = 20.0;
/// 失败率超过该百分比时标记为 MAJORITY_FAILED
pub const MAJORITY_FAILED_THRESHOLD: f64 = 50.0;

/// 基于标签的实例选择条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFilter {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Values")]
    pub values: Vec<String>,
}

/// 命令输出存储位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLocation {
    pub bucket: String,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// 下发请求
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub document_name: String,
    pub filters: Vec<TargetFilter>,
    pub max_concurrency: String,
    pub max_errors: String,
    pub parameters: HashMap<String, Vec<String>>,
    pub output_location: Option<OutputLocation>,
    /// 幂等令牌，同一上下文的重试使用同一令牌
    pub client_token: String,
}

/// 单实例调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationStatus {
    Pending,
    Delayed,
    InProgress,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Success
                | InvocationStatus::Failed
                | InvocationStatus::Cancelled
                | InvocationStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "Pending",
            InvocationStatus::Delayed => "Delayed",
            InvocationStatus::InProgress => "InProgress",
            InvocationStatus::Success => "Success",
            InvocationStatus::Failed => "Failed",
            InvocationStatus::Cancelled => "Cancelled",
            InvocationStatus::TimedOut => "TimedOut",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub instance_id: String,
    pub status: InvocationStatus,
    #[serde(default)]
    pub status_details: Option<String>,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

/// 命令整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    NoInvocations,
    InProgress,
    AllSuccess,
    CompletedWithFailures,
    HighFailureRate,
    MajorityFailed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::NoInvocations => "NO_INVOCATIONS",
            OverallStatus::InProgress => "IN_PROGRESS",
            OverallStatus::AllSuccess => "ALL_SUCCESS",
            OverallStatus::CompletedWithFailures => "COMPLETED_WITH_FAILURES",
            OverallStatus::HighFailureRate => "HIGH_FAILURE_RATE",
            OverallStatus::MajorityFailed => "MAJORITY_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    /// Failed + TimedOut + Cancelled
    pub failed: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub overall_status: OverallStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub all_done: bool,
    pub summary: PollSummary,
    pub per_instance: Vec<Invocation>,
}

impl PollResult {
    /// 对一次完整的调用列表进行分类汇总
    pub fn from_invocations(per_instance: Vec<Invocation>) -> Self {
        let total = per_instance.len();
        let completed = per_instance.iter().filter(|i| i.status.is_terminal()).count();
        let succeeded = per_instance
            .iter()
            .filter(|i| i.status == InvocationStatus::Success)
            .count();
        let failed = completed - succeeded;
        let in_progress = total - completed;

        let all_done = total > 0 && completed == total;

        let (success_rate, failure_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                round2(succeeded as f64 / total as f64 * 100.0),
                round2(failed as f64 / total as f64 * 100.0),
            )
        };

        let overall_status = if total == 0 {
            OverallStatus::NoInvocations
        } else if !all_done {
            OverallStatus::InProgress
        } else if failed == 0 {
            OverallStatus::AllSuccess
        } else if failure_rate > MAJORITY_FAILED_THRESHOLD {
            OverallStatus::MajorityFailed
        } else if failure_rate > HIGH_FAILURE_RATE_THRESHOLD {
            OverallStatus::HighFailureRate
        } else {
            OverallStatus::CompletedWithFailures
        };

        Self {
            all_done,
            summary: PollSummary {
                total,
                completed,
                in_progress,
                succeeded,
                failed,
                success_rate,
                failure_rate,
                overall_status,
            },
            per_instance,
        }
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
