//! 审批模型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalAction::Approve => "approve",
            ApprovalAction::Reject => "reject",
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalAction::Approve),
            "reject" => Ok(ApprovalAction::Reject),
            other => Err(AppError::ApprovalRejected(format!("Invalid action: {}", other))),
        }
    }
}

/// 发起审批所需信息
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub execution_id: String,
    pub continuation_token: String,
    pub subject: Option<String>,
    /// 问题摘要（已格式化为文本）
    pub details: Option<String>,
    pub estimated_duration_minutes: Option<u32>,
}

/// 已签名的审批链接对
#[derive(Debug, Clone)]
pub struct ApprovalLinks {
    pub approve_url: String,
    pub reject_url: String,
    /// 链接签发时间（Unix 秒）
    pub issued_at: i64,
    pub token_hash: String,
    pub notification_id: Option<String>,
}

/// 回调原始查询参数，字段缺失在解析阶段处理
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub action: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "executionId")]
    pub execution_id: Option<String>,
    pub timestamp: Option<String>,
    pub sig: Option<String>,
}

/// 回调请求来源信息（审计用）
#[derive(Debug, Clone, Default)]
pub struct CallbackMeta {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// 审批决定
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: ApprovalAction,
    pub execution_id: String,
    pub token_hash: String,
}

/// 发送给挂起步骤的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationOutcome {
    Success { output: serde_json::Value },
    Failure { error: String, cause: String },
}

impl ContinuationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ContinuationOutcome::Success { .. })
    }
}
