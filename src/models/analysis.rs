//! 问题分析契约

use serde::{Deserialize, Serialize};
use std::fmt;

/// 分析给出的后续动作建议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    AbortExecution,
    ContinueWithCaution,
    ContinueNormal,
    ManualReviewRequired,
}

impl Recommendation {
    /// 未知取值一律转人工复核
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ABORT_EXECUTION" => Self::AbortExecution,
            "CONTINUE_WITH_CAUTION" => Self::ContinueWithCaution,
            "CONTINUE_NORMAL" => Self::ContinueNormal,
            _ => Self::ManualReviewRequired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortExecution => "ABORT_EXECUTION",
            Self::ContinueWithCaution => "CONTINUE_WITH_CAUTION",
            Self::ContinueNormal => "CONTINUE_NORMAL",
            Self::ManualReviewRequired => "MANUAL_REVIEW_REQUIRED",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 未知取值按 MEDIUM 处理
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOW" => Self::Low,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            _ => Self::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// 分析步骤请求
///
/// 问题可以直接放在 `issues`，也可以沿用上游步骤的输出结构
/// （`post.Payload.issues`、`postEc2.Payload.issues`、`postWave[0].Payload.issues`）。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub issues: Option<serde_json::Value>,
    pub post: Option<serde_json::Value>,
    pub post_ec2: Option<serde_json::Value>,
    #[serde(default)]
    pub post_wave: Vec<serde_json::Value>,
    pub context: Option<String>,
    #[serde(default)]
    pub abort_on_issues: bool,
}

/// 分析结论
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub status_code: u16,
    pub success: bool,
    pub recommendation: Recommendation,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 助手回复（结构化或包装后的原文）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub issues_analyzed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_parsing() {
        assert_eq!(Recommendation::parse_lenient("abort_execution"), Recommendation::AbortExecution);
        assert_eq!(Recommendation::parse_lenient("ROLLBACK"), Recommendation::ManualReviewRequired);
        assert_eq!(Severity::parse_lenient("critical"), Severity::Critical);
        assert_eq!(Severity::parse_lenient(""), Severity::Medium);
    }

    #[test]
    fn test_report_wire_shape() {
        let report = AnalysisReport {
            status_code: 200,
            success: true,
            recommendation: Recommendation::ContinueNormal,
            severity: Severity::Low,
            message: None,
            analysis: None,
            session_id: None,
            issues_analyzed: 0,
            context: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["recommendation"], "CONTINUE_NORMAL");
        assert_eq!(json["severity"], "LOW");
        assert_eq!(json["statusCode"], 200);
        assert!(json.get("sessionId").is_none());
    }
}
