//! 执行与波次模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::command::OverallStatus;
use super::patch::IssueReport;
use super::target::Target;
use crate::error::{AppError, Result};

/// 出现问题时的中止策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// 立即停止后续波次
    Halt,
    /// 先经人工审批，批准则继续
    RequireApproval,
}

/// 一个波次：一组目标 + 波次后的暂停
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wave {
    pub index: usize,
    pub targets: Vec<Target>,
    #[serde(default, with = "duration_secs")]
    pub pause: Duration,
}

/// 一次端到端执行，启动后除终态外不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub waves: Vec<Wave>,
    pub abort_on_issues: bool,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(id: Option<String>, waves: Vec<Wave>, abort_on_issues: bool) -> Result<Self> {
        if waves.is_empty() {
            return Err(AppError::validation("at least one wave is required"));
        }
        if let Some(wave) = waves.iter().find(|w| w.targets.is_empty()) {
            return Err(AppError::Validation(format!("wave {} has no targets", wave.index)));
        }

        Ok(Self {
            id: id.unwrap_or_else(|| format!("exec-{}", Uuid::new_v4())),
            waves,
            abort_on_issues,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running { wave: usize },
    AwaitingApproval { wave: usize },
    Completed,
    Aborted { reason: String },
    Failed { reason: String },
    /// 等待外部引擎从检查点重新进入
    Suspended { resume_from_wave: usize },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Aborted { .. } | ExecutionStatus::Failed { .. }
        )
    }
}

/// 单目标流水线结果，失败被捕获而非向上传播
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target: Target,
    pub command_id: Option<String>,
    pub command_status: Option<OverallStatus>,
    pub report: Option<IssueReport>,
    pub error: Option<String>,
    pub error_type: Option<String>,
}

impl TargetOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn problematic_instances(&self) -> usize {
        self.report.as_ref().map(|r| r.problematic_instances).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    /// 全部处理成功
    Complete,
    /// 部分目标失败
    Partial,
    /// 没有目标处理成功
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveResult {
    pub index: usize,
    pub status: WaveStatus,
    pub outcomes: Vec<TargetOutcome>,
    pub problematic_instances: usize,
}

impl WaveResult {
    /// 并行工作全部结束后汇总
    pub fn aggregate(index: usize, outcomes: Vec<TargetOutcome>) -> Self {
        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        let status = if failed == 0 {
            WaveStatus::Complete
        } else if failed < outcomes.len() {
            WaveStatus::Partial
        } else {
            WaveStatus::Failed
        };
        let problematic_instances = outcomes.iter().map(|o| o.problematic_instances()).sum();

        Self {
            index,
            status,
            outcomes,
            problematic_instances,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub waves: Vec<WaveResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 新建执行的 HTTP 请求体
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionRequest {
    pub execution_id: Option<String>,
    pub waves: Vec<WaveSpec>,
    #[serde(default = "default_true")]
    pub abort_on_issues: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveSpec {
    pub targets: Vec<Target>,
    #[serde(default)]
    pub pause_secs: u64,
}

impl CreateExecutionRequest {
    pub fn into_execution(self) -> Result<Execution> {
        let waves = self
            .waves
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Wave {
                index,
                targets: spec.targets,
                pause: Duration::from_secs(spec.pause_secs),
            })
            .collect();
        Execution::new(self.execution_id, waves, self.abort_on_issues)
    }
}

fn default_true() -> bool {
    true
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::patch::IssueReport;

    fn outcome(account: &str, problematic: usize, error: Option<&str>) -> TargetOutcome {
        TargetOutcome {
            target: Target::parse(account, "us-east-1").unwrap(),
            command_id: Some("cmd".into()),
            command_status: None,
            report: error.is_none().then(|| IssueReport {
                total_instances: 5,
                healthy_instances: 5 - problematic,
                problematic_instances: problematic,
                failed_instances: 0,
                missing_instances: problematic,
                issues: vec![],
                success_rate: 0.0,
                analysis: String::new(),
            }),
            error: error.map(String::from),
            error_type: None,
        }
    }

    #[test]
    fn test_wave_aggregation_sums_problematic() {
        let result = WaveResult::aggregate(
            0,
            vec![outcome("111111111111", 3, None), outcome("222222222222", 0, None)],
        );
        assert_eq!(result.problematic_instances, 3);
        assert_eq!(result.status, WaveStatus::Complete);
    }

    #[test]
    fn test_wave_status_partial_and_failed() {
        let partial = WaveResult::aggregate(
            0,
            vec![outcome("111111111111", 0, None), outcome("222222222222", 0, Some("denied"))],
        );
        assert_eq!(partial.status, WaveStatus::Partial);

        let failed = WaveResult::aggregate(1, vec![outcome("111111111111", 0, Some("denied"))]);
        assert_eq!(failed.status, WaveStatus::Failed);
    }

    #[test]
    fn test_execution_requires_targets() {
        assert!(Execution::new(None, vec![], true).is_err());
        let empty_wave = Wave {
            index: 0,
            targets: vec![],
            pause: Duration::ZERO,
        };
        assert!(Execution::new(None, vec![empty_wave], true).is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Aborted { reason: "x".into() }.is_terminal());
        assert!(!ExecutionStatus::Suspended { resume_from_wave: 1 }.is_terminal());
        assert!(!ExecutionStatus::AwaitingApproval { wave: 0 }.is_terminal());
    }
}
