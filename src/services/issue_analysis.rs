//! 补丁问题分析
//!
//! 把校验发现的问题整理成提示交给分析助手，并把回复归一为建议与严重度。
//! 没有问题时直接给出 CONTINUE_NORMAL / LOW，不调用助手。

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::instrument;

use crate::cloud::IssueAnalyst;
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::analysis::{AnalysisReport, AnalysisRequest, Recommendation, Severity};
use crate::retry::RetryPolicy;

const DEFAULT_CONTEXT: &str = "standard";
const ABORT_CONTEXT: &str = "critical-failure-analysis";
const EMPTY_REPLY_FALLBACK: &str = "Analysis completed but no specific recommendations generated. \
     Please review the execution logs and consider manual investigation.";

pub struct IssueAnalysisService {
    analyst: Option<Arc<dyn IssueAnalyst>>,
    retry: RetryPolicy,
}

impl IssueAnalysisService {
    pub fn new(analyst: Option<Arc<dyn IssueAnalyst>>, retry: RetryPolicy) -> Self {
        Self { analyst, retry }
    }

    #[instrument(skip(self, ctx, request), fields(correlation_id = %ctx.correlation_id))]
    pub async fn analyze(&self, ctx: &CorrelationContext, request: &AnalysisRequest) -> Result<AnalysisReport> {
        let Some(issues) = extract_issues(request) else {
            tracing::info!("No issues detected, analysis skipped");
            return Ok(AnalysisReport {
                status_code: 200,
                success: true,
                recommendation: Recommendation::ContinueNormal,
                severity: Severity::Low,
                message: Some("No issues detected - analysis not required".to_string()),
                analysis: None,
                session_id: None,
                issues_analyzed: 0,
                context: None,
            });
        };

        let Some(analyst) = self.analyst.as_ref() else {
            return Err(AppError::BadRequest("Issue analyst is not configured".into()));
        };

        let context = if request.abort_on_issues {
            ABORT_CONTEXT.to_string()
        } else {
            request
                .context
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTEXT.to_string())
        };
        let prompt = create_analysis_prompt(&issues, &context);
        let session_id = analysis_session_id(&prompt);
        let issues_analyzed = issues.as_array().map(Vec::len).unwrap_or(1);
        tracing::info!(session_id = %session_id, issues = issues_analyzed, context = %context, "Analyzing issues");

        let reply = self
            .retry
            .run("analyze_issues", ctx, |_| {
                let analyst = analyst.clone();
                let session_id = session_id.clone();
                let prompt = prompt.clone();
                async move { analyst.analyze(&session_id, &prompt).await }
            })
            .await?;

        let (analysis, recommendation, severity) = parse_analysis_response(&reply);
        tracing::info!(
            recommendation = recommendation.as_str(),
            severity = severity.as_str(),
            "Issue analysis completed"
        );

        Ok(AnalysisReport {
            status_code: 200,
            success: true,
            recommendation,
            severity,
            message: None,
            analysis: Some(analysis),
            session_id: Some(session_id),
            issues_analyzed,
            context: Some(context),
        })
    }
}

/// 按上游步骤的几种输出结构查找问题集，空集合视为没有问题
pub fn extract_issues(request: &AnalysisRequest) -> Option<Value> {
    let from_payload = |step: &Value| step.get("Payload").map(|p| p.get("issues").cloned());

    let issues = if let Some(found) = request.post.as_ref().and_then(from_payload) {
        found
    } else if let Some(found) = request.post_ec2.as_ref().and_then(from_payload) {
        found
    } else if let Some(found) = request.post_wave.first().and_then(from_payload) {
        found
    } else {
        request.issues.clone()
    };

    issues.filter(|v| match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(_) => true,
    })
}

pub fn create_analysis_prompt(issues: &Value, context: &str) -> String {
    let issues_json = serde_json::to_string_pretty(issues).unwrap_or_else(|_| issues.to_string());
    format!(
        "You are a site reliability engineer reviewing EC2 patching discrepancies.\n\n\
         ANALYSIS CONTEXT: {}\n\n\
         PATCH EXECUTION ISSUES:\n{}\n\n\
         Assess severity (CRITICAL, HIGH, MEDIUM or LOW), likely root causes, impact, \
         immediate actions and a remediation plan.\n\n\
         Finish with one RECOMMENDATION:\n\
         - ABORT_EXECUTION: critical issues requiring an immediate halt\n\
         - CONTINUE_WITH_CAUTION: proceed with enhanced monitoring\n\
         - CONTINUE_NORMAL: issues are manageable, proceed as planned\n\n\
         Format the response as a JSON object with \"recommendation\", \"severity\" and \"summary\" fields.",
        context.to_uppercase(),
        issues_json,
    )
}

/// 把助手回复归一为 (分析内容, 建议, 严重度)
///
/// 非 JSON 或无法解析的回复保留原文，建议为 MANUAL_REVIEW_REQUIRED，严重度 MEDIUM。
pub fn parse_analysis_response(reply: &str) -> (Value, Recommendation, Severity) {
    let reply = match reply.trim() {
        "" => EMPTY_REPLY_FALLBACK,
        trimmed => trimmed,
    };

    if reply.starts_with('{') {
        match serde_json::from_str::<Value>(reply) {
            Ok(parsed) => {
                let recommendation = parsed
                    .get("recommendation")
                    .and_then(Value::as_str)
                    .map(Recommendation::parse_lenient)
                    .unwrap_or(Recommendation::ManualReviewRequired);
                let severity = parsed
                    .get("severity")
                    .and_then(Value::as_str)
                    .map(Severity::parse_lenient)
                    .unwrap_or(Severity::Medium);
                return (parsed, recommendation, severity);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Analysis reply is not valid JSON");
                let wrapped = json!({
                    "analysis": reply,
                    "recommendation": Recommendation::ManualReviewRequired.as_str(),
                    "severity": Severity::Medium.as_str(),
                    "parseError": e.to_string(),
                    "summary": "Analysis completed but response format requires manual interpretation.",
                });
                return (wrapped, Recommendation::ManualReviewRequired, Severity::Medium);
            }
        }
    }

    let wrapped = json!({
        "analysis": reply,
        "recommendation": Recommendation::ManualReviewRequired.as_str(),
        "severity": Severity::Medium.as_str(),
        "summary": "Analysis completed successfully but requires manual review of recommendations.",
    });
    (wrapped, Recommendation::ManualReviewRequired, Severity::Medium)
}

/// 会话 ID：时间戳 + 提示哈希前缀
fn analysis_session_id(prompt: &str) -> String {
    let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
    format!("patch-analysis-{}-{}", Utc::now().timestamp(), &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::ScriptedAnalyst;

    fn service(analyst: Arc<ScriptedAnalyst>) -> IssueAnalysisService {
        IssueAnalysisService::new(Some(analyst), RetryPolicy::immediate(3))
    }

    fn with_issues(issues: Value) -> AnalysisRequest {
        AnalysisRequest {
            issues: Some(issues),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_issues_from_step_outputs() {
        let request: AnalysisRequest = serde_json::from_value(json!({
            "postWave": [{ "Payload": { "issues": [{ "instanceId": "i-1", "missing": 2 }] } }],
        }))
        .unwrap();
        assert_eq!(extract_issues(&request).unwrap().as_array().unwrap().len(), 1);

        let request: AnalysisRequest = serde_json::from_value(json!({
            "post": { "Payload": { "issues": { "123456789012:us-east-1": ["i-1"] } } },
            "issues": [],
        }))
        .unwrap();
        assert!(extract_issues(&request).unwrap().is_object());

        // 上游结构存在但问题为空时不回落到顶层字段
        let request: AnalysisRequest = serde_json::from_value(json!({
            "postEc2": { "Payload": { "issues": [] } },
            "issues": ["stale"],
        }))
        .unwrap();
        assert!(extract_issues(&request).is_none());
    }

    #[test]
    fn test_non_json_reply_needs_manual_review() {
        let (analysis, recommendation, severity) = parse_analysis_response("Looks like a reboot is pending.");
        assert_eq!(recommendation, Recommendation::ManualReviewRequired);
        assert_eq!(severity, Severity::Medium);
        assert_eq!(analysis["analysis"], "Looks like a reboot is pending.");

        let (analysis, recommendation, _) = parse_analysis_response("{ truncated");
        assert_eq!(recommendation, Recommendation::ManualReviewRequired);
        assert!(analysis["parseError"].is_string());

        let (_, recommendation, _) = parse_analysis_response("   ");
        assert_eq!(recommendation, Recommendation::ManualReviewRequired);
    }

    #[test]
    fn test_structured_reply_is_used() {
        let (_, recommendation, severity) =
            parse_analysis_response(r#"{"recommendation":"ABORT_EXECUTION","severity":"CRITICAL"}"#);
        assert_eq!(recommendation, Recommendation::AbortExecution);
        assert_eq!(severity, Severity::Critical);
    }

    #[test]
    fn test_prompt_carries_context_and_issues() {
        let prompt = create_analysis_prompt(&json!([{ "instanceId": "i-9" }]), "critical-failure-analysis");
        assert!(prompt.contains("ANALYSIS CONTEXT: CRITICAL-FAILURE-ANALYSIS"));
        assert!(prompt.contains("\"instanceId\": \"i-9\""));
    }

    #[tokio::test]
    async fn test_no_issues_skips_analyst() {
        let analyst = Arc::new(ScriptedAnalyst::new());
        let report = service(analyst.clone())
            .analyze(&CorrelationContext::new(), &with_issues(json!([])))
            .await
            .unwrap();

        assert_eq!(report.recommendation, Recommendation::ContinueNormal);
        assert_eq!(report.severity, Severity::Low);
        assert_eq!(report.issues_analyzed, 0);
        assert!(analyst.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_issues_are_analyzed() {
        let analyst = Arc::new(ScriptedAnalyst::new());
        analyst.push_reply(r#"{"recommendation":"CONTINUE_WITH_CAUTION","severity":"HIGH"}"#);
        let request = AnalysisRequest {
            abort_on_issues: true,
            ..with_issues(json!([{ "instanceId": "i-1" }, { "instanceId": "i-2" }]))
        };

        let report = service(analyst.clone())
            .analyze(&CorrelationContext::new(), &request)
            .await
            .unwrap();

        assert_eq!(report.recommendation, Recommendation::ContinueWithCaution);
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.issues_analyzed, 2);
        assert_eq!(report.context.as_deref(), Some(ABORT_CONTEXT));
        assert!(report.session_id.unwrap().starts_with("patch-analysis-"));
        assert_eq!(analyst.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_throttled_analyst_is_retried() {
        let analyst = Arc::new(ScriptedAnalyst::new());
        analyst.push_failure(AppError::Throttled("slow down".into()));
        analyst.push_reply("plain text answer");

        let report = service(analyst.clone())
            .analyze(&CorrelationContext::new(), &with_issues(json!(["i-1 missing patches"])))
            .await
            .unwrap();

        assert_eq!(report.recommendation, Recommendation::ManualReviewRequired);
        assert_eq!(analyst.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_analyst_is_rejected() {
        let service = IssueAnalysisService::new(None, RetryPolicy::immediate(1));
        let err = service
            .analyze(&CorrelationContext::new(), &with_issues(json!(["x"])))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
