//! 审计与状态记录模型

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::Target;

/// 状态记录类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateScope {
    Pre,
    Post,
}

impl StateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateScope::Pre => "PRE",
            StateScope::Post => "POST",
        }
    }
}

/// 补丁前/后状态快照记录，键为 `scope#id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub scope: StateScope,
    /// `account:region:YYYY-MM-DD`
    pub id: String,
    pub execution_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        scope: StateScope,
        target: &Target,
        execution_id: Option<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> Self {
        Self {
            scope,
            id: state_id(target, now.date_naive()),
            execution_id,
            payload,
            created_at: now,
            expires_at: now + Duration::days(ttl_days),
        }
    }

    pub fn key(&self) -> String {
        record_key(self.scope, &self.id)
    }
}

pub fn state_id(target: &Target, date: NaiveDate) -> String {
    format!("{}:{}:{}", target.account_id, target.region, date.format("%Y-%m-%d"))
}

pub fn record_key(scope: StateScope, id: &str) -> String {
    format!("{}#{}", scope.as_str(), id)
}

/// 制品存储键：`YYYY/MM/DD/account/region/<name>.json`
pub fn artifact_key(date: NaiveDate, target: &Target, artifact_name: &str) -> String {
    format!(
        "{}/{}/{}/{}.json",
        date.format("%Y/%m/%d"),
        target.account_id,
        target.region,
        artifact_name
    )
}

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    TargetCompleted,
    ApprovalRequested,
    ApprovalDecision,
    ExecutionFinished,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::TargetCompleted => "target.completed",
            AuditEvent::ApprovalRequested => "approval.requested",
            AuditEvent::ApprovalDecision => "approval.decision",
            AuditEvent::ExecutionFinished => "execution.finished",
        }
    }
}

/// 只追加的审计记录，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_type: String,
    pub execution_id: Option<String>,
    pub action: String,
    /// 目标（account:region）或令牌哈希等
    pub subject: Option<String>,
    pub details: serde_json::Value,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_record_key_shape() {
        let target = Target::parse("123456789012", "us-east-1").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 10, 0, 0).unwrap();
        let record = StateRecord::new(StateScope::Post, &target, None, serde_json::json!({}), now, 90);

        assert_eq!(record.key(), "POST#123456789012:us-east-1:2025-03-07");
        assert_eq!(record.expires_at - record.created_at, Duration::days(90));
    }

    #[test]
    fn test_artifact_key_shape() {
        let target = Target::parse("123456789012", "eu-west-1").unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert_eq!(
            artifact_key(date, &target, "post_ec2_patchstates"),
            "2025/01/02/123456789012/eu-west-1/post_ec2_patchstates.json"
        );
    }
}
