//! 审计服务
//!
//! 记录审批决定与每个目标的完成情况，记录只追加、带保留期限。

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::context::CorrelationContext;
use crate::error::Result;
use crate::models::approval::{CallbackMeta, Decision};
use crate::models::audit::{AuditEvent, AuditRecord};
use crate::models::execution::{ExecutionResult, TargetOutcome};
use crate::repository::RecordStore;

/// 审计条目参数
#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub event: AuditEvent,
    pub action: &'a str,
    pub subject: Option<&'a str>,
    pub details: serde_json::Value,
}

pub struct AuditService {
    store: Arc<dyn RecordStore>,
    ttl_days: i64,
}

impl AuditService {
    pub fn new(store: Arc<dyn RecordStore>, ttl_days: i64) -> Self {
        Self { store, ttl_days }
    }

    /// 追加一条审计记录
    #[instrument(skip(self, ctx, entry), fields(event = entry.event.as_str(), correlation_id = %ctx.correlation_id))]
    pub async fn record(&self, ctx: &CorrelationContext, entry: AuditEntry<'_>) -> Result<AuditRecord> {
        let now = Utc::now();
        let record = AuditRecord {
            id: Uuid::new_v4(),
            event_type: entry.event.as_str().to_string(),
            execution_id: ctx.execution_id.clone(),
            action: entry.action.to_string(),
            subject: entry.subject.map(|s| s.to_string()),
            details: entry.details,
            correlation_id: Some(ctx.correlation_id.clone()),
            occurred_at: now,
            expires_at: now + Duration::days(self.ttl_days),
        };

        self.store.append_audit(&record).await?;
        tracing::debug!(audit_id = %record.id, action = %record.action, "Audit record appended");
        Ok(record)
    }

    pub async fn record_target_completion(
        &self,
        ctx: &CorrelationContext,
        outcome: &TargetOutcome,
    ) -> Result<()> {
        let subject = outcome.target.to_string();
        let action = if outcome.succeeded() { "completed" } else { "failed" };
        self.record(
            ctx,
            AuditEntry {
                event: AuditEvent::TargetCompleted,
                action,
                subject: Some(&subject),
                details: serde_json::json!({
                    "commandId": outcome.command_id,
                    "commandStatus": outcome.command_status,
                    "problematicInstances": outcome.problematic_instances(),
                    "error": outcome.error,
                }),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn record_decision(
        &self,
        ctx: &CorrelationContext,
        decision: &Decision,
        meta: &CallbackMeta,
    ) -> Result<()> {
        self.record(
            ctx,
            AuditEntry {
                event: AuditEvent::ApprovalDecision,
                action: decision.action.as_str(),
                subject: Some(&decision.token_hash),
                details: serde_json::json!({
                    "executionId": decision.execution_id,
                    "sourceIp": meta.source_ip,
                    "userAgent": meta.user_agent,
                }),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn record_execution_finished(
        &self,
        ctx: &CorrelationContext,
        result: &ExecutionResult,
    ) -> Result<()> {
        self.record(
            ctx,
            AuditEntry {
                event: AuditEvent::ExecutionFinished,
                action: "finished",
                subject: Some(&result.execution_id),
                details: serde_json::json!({
                    "status": result.status,
                    "waves": result.waves.len(),
                }),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn history(&self, execution_id: &str) -> Result<Vec<AuditRecord>> {
        self.store.list_audit(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::approval::ApprovalAction;
    use crate::repository::MemoryRecordStore;

    #[tokio::test]
    async fn test_decision_record_has_retention() {
        let store = Arc::new(MemoryRecordStore::new());
        let service = AuditService::new(store.clone(), 365);
        let ctx = CorrelationContext::for_execution("exec-1");

        let decision = Decision {
            action: ApprovalAction::Reject,
            execution_id: "exec-1".into(),
            token_hash: "abcd1234".into(),
        };
        let meta = CallbackMeta {
            source_ip: Some("10.0.0.1".into()),
            user_agent: Some("curl".into()),
        };
        service.record_decision(&ctx, &decision, &meta).await.unwrap();

        let history = service.history("exec-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "reject");
        assert_eq!(history[0].event_type, "approval.decision");
        assert_eq!(history[0].expires_at - history[0].occurred_at, Duration::days(365));
        assert_eq!(history[0].details["sourceIp"], "10.0.0.1");
    }
}
