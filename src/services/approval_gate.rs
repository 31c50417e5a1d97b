//! 人工审批关卡
//!
//! 签发带 HMAC 签名与签发时间的批准/拒绝链接，回调时校验后续接挂起的执行。
//! 规范串：`token:timestamp:action:executionId`，签名为 HMAC-SHA256 的十六进制。

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use super::audit_service::{AuditEntry, AuditService};
use super::secret_provider::SecretProvider;
use crate::cloud::{ContinuationSink, Notifier};
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::approval::{
    ApprovalAction, ApprovalLinks, ApprovalRequest, CallbackMeta, CallbackQuery, ContinuationOutcome,
    Decision,
};
use crate::models::audit::AuditEvent;
use crate::repository::RecordStore;
use crate::retry::RetryPolicy;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_SUBJECT: &str = "EC2 Patching Approval Required";
const REJECTION_ERROR: &str = "ManualRejection";

pub struct ApprovalGate {
    secrets: Arc<SecretProvider>,
    notifier: Arc<dyn Notifier>,
    continuations: Arc<dyn ContinuationSink>,
    records: Arc<dyn RecordStore>,
    audit: Arc<AuditService>,
    retry: RetryPolicy,
    callback_base_url: String,
    expiry: Duration,
}

impl ApprovalGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        secrets: Arc<SecretProvider>,
        notifier: Arc<dyn Notifier>,
        continuations: Arc<dyn ContinuationSink>,
        records: Arc<dyn RecordStore>,
        audit: Arc<AuditService>,
        retry: RetryPolicy,
        callback_base_url: &str,
        expiry: Duration,
    ) -> Self {
        Self {
            secrets,
            notifier,
            continuations,
            records,
            audit,
            retry,
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// 签发审批链接并发送通知
    #[instrument(skip(self, ctx, request), fields(execution_id = %request.execution_id, correlation_id = %ctx.correlation_id))]
    pub async fn request_approval(
        &self,
        ctx: &CorrelationContext,
        request: ApprovalRequest,
    ) -> Result<ApprovalLinks> {
        if request.continuation_token.is_empty() {
            return Err(AppError::validation("continuation token is required"));
        }

        let issued_at = Utc::now().timestamp();
        let mut links = self.sign_links(&request, issued_at).await?;

        // 审计先落盘，失败时不发出任何可点击的链接
        self.audit
            .record(
                ctx,
                AuditEntry {
                    event: AuditEvent::ApprovalRequested,
                    action: "requested",
                    subject: Some(&links.token_hash),
                    details: serde_json::json!({
                        "executionId": request.execution_id,
                        "expiresInMinutes": self.expiry.as_secs() / 60,
                    }),
                },
            )
            .await?;

        let subject = request
            .subject
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUBJECT);
        let message = self.notification_body(&request, &links, Utc::now());
        let message_id = self.notifier.publish(subject, &message).await?;
        links.notification_id = Some(message_id.clone());

        // 链接含签名令牌，只记录长度
        tracing::info!(
            token_hash = %links.token_hash,
            approve_url_length = links.approve_url.len(),
            reject_url_length = links.reject_url.len(),
            message_id = %message_id,
            "Approval request sent"
        );

        Ok(links)
    }

    async fn sign_links(&self, request: &ApprovalRequest, issued_at: i64) -> Result<ApprovalLinks> {
        let key = self.secrets.signing_key().await?;
        if key.is_none() {
            tracing::warn!("Approval signing is disabled, issuing unsigned links");
        }

        let approve_url = self.build_link(request, ApprovalAction::Approve, issued_at, key)?;
        let reject_url = self.build_link(request, ApprovalAction::Reject, issued_at, key)?;

        Ok(ApprovalLinks {
            approve_url,
            reject_url,
            issued_at,
            token_hash: short_token_hash(&request.continuation_token),
            notification_id: None,
        })
    }

    fn build_link(
        &self,
        request: &ApprovalRequest,
        action: ApprovalAction,
        issued_at: i64,
        key: Option<&Secret<String>>,
    ) -> Result<String> {
        let mut url = Url::parse(&format!("{}/callback", self.callback_base_url))
            .map_err(|e| AppError::Config(format!("invalid callback base url: {}", e)))?;

        let timestamp = issued_at.to_string();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("action", action.as_str())
                .append_pair("token", &request.continuation_token)
                .append_pair("executionId", &request.execution_id)
                .append_pair("timestamp", &timestamp);
            if let Some(key) = key {
                let canonical =
                    canonical_string(&request.continuation_token, &timestamp, action, &request.execution_id);
                pairs.append_pair("sig", &sign(key, &canonical)?);
            }
        }

        Ok(url.into())
    }

    fn notification_body(&self, request: &ApprovalRequest, links: &ApprovalLinks, now: DateTime<Utc>) -> String {
        let duration = request
            .estimated_duration_minutes
            .map(|m| format!("{} minutes", m))
            .unwrap_or_else(|| "unknown".to_string());
        let details = request
            .details
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or("No additional details provided.");

        format!(
            "APPROVAL REQUIRED: EC2 Patching Operation\n\n\
             Execution ID: {}\n\
             Request Time: {}\n\
             Estimated Duration: {}\n\
             Request ID: {}\n\n\
             Operation Details:\n{}\n\n\
             APPROVE: {}\n\n\
             REJECT:  {}\n\n\
             Note: Approval will expire after {} minutes.\n\
             All operations are logged and audited.",
            request.execution_id,
            now.format("%Y-%m-%d %H:%M:%S UTC"),
            duration,
            links.token_hash,
            details,
            links.approve_url,
            links.reject_url,
            self.expiry.as_secs() / 60,
        )
    }

    /// 处理审批回调
    ///
    /// 校验失败只拒绝本次请求，挂起的执行保持不变。
    #[instrument(skip(self, ctx, query, meta), fields(correlation_id = %ctx.correlation_id))]
    pub async fn resolve(
        &self,
        ctx: &CorrelationContext,
        query: CallbackQuery,
        meta: CallbackMeta,
    ) -> Result<Decision> {
        self.resolve_at(ctx, query, meta, Utc::now().timestamp()).await
    }

    pub(crate) async fn resolve_at(
        &self,
        ctx: &CorrelationContext,
        query: CallbackQuery,
        meta: CallbackMeta,
        now: i64,
    ) -> Result<Decision> {
        let (action, token, execution_id) = self.verify(query, now).await?;
        let token_hash = short_token_hash(&token);

        if !self
            .records
            .mark_resolved(&full_token_hash(&token), &execution_id, action.as_str())
            .await?
        {
            tracing::warn!(token_hash = %token_hash, "Approval already resolved");
            return Err(AppError::AlreadyResolved(format!(
                "approval {} has already been resolved",
                token_hash
            )));
        }

        let outcome = match action {
            ApprovalAction::Approve => ContinuationOutcome::Success {
                output: serde_json::json!({
                    "approved": true,
                    "decision": "approved",
                    "executionId": execution_id,
                    "approvalTimestamp": Utc::now(),
                }),
            },
            ApprovalAction::Reject => ContinuationOutcome::Failure {
                error: REJECTION_ERROR.to_string(),
                cause: "manual rejection".to_string(),
            },
        };

        self.retry
            .run("send_outcome", ctx, |_| {
                let continuations = self.continuations.clone();
                let token = token.clone();
                let outcome = outcome.clone();
                async move { continuations.send_outcome(&token, outcome).await }
            })
            .await?;

        let decision = Decision {
            action,
            execution_id,
            token_hash,
        };
        // 续接已送达，之后的审计与通知失败不能再把回调变成错误
        let ctx = ctx.clone().with_execution(Some(decision.execution_id.clone()));
        if let Err(e) = self.audit.record_decision(&ctx, &decision, &meta).await {
            tracing::warn!(
                error = %e,
                token_hash = %decision.token_hash,
                "Failed to audit approval decision"
            );
        }
        self.notify_decision(&decision).await;

        tracing::info!(
            action = %decision.action,
            execution_id = %decision.execution_id,
            token_hash = %decision.token_hash,
            source_ip = meta.source_ip.as_deref().unwrap_or("unknown"),
            "Approval decision processed"
        );
        Ok(decision)
    }

    /// 校验回调参数，返回 (动作, 令牌, 执行 ID)
    async fn verify(&self, query: CallbackQuery, now: i64) -> Result<(ApprovalAction, String, String)> {
        let (Some(action), Some(token), Some(timestamp), Some(sig)) =
            (query.action, query.token, query.timestamp, query.sig)
        else {
            return Err(AppError::ApprovalRejected("Missing required parameters".into()));
        };
        if token.is_empty() || sig.is_empty() {
            return Err(AppError::ApprovalRejected("Missing required parameters".into()));
        }

        let action: ApprovalAction = action.parse()?;

        let Some(key) = self.secrets.signing_key().await? else {
            return Err(AppError::ApprovalRejected("Approval signing is not configured".into()));
        };

        let issued_at: i64 = timestamp
            .parse()
            .map_err(|_| AppError::ApprovalRejected("Invalid timestamp".into()))?;
        let age = now.saturating_sub(issued_at).unsigned_abs();
        if age > self.expiry.as_secs() {
            return Err(AppError::ApprovalRejected("Approval link has expired".into()));
        }

        let execution_id = query.execution_id.unwrap_or_else(|| "unknown".to_string());
        let canonical = canonical_string(&token, &timestamp, action, &execution_id);
        let provided =
            hex::decode(&sig).map_err(|_| AppError::ApprovalRejected("Invalid signature".into()))?;
        let mut mac = new_mac(key)?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| AppError::ApprovalRejected("Invalid signature".into()))?;

        Ok((action, token, execution_id))
    }

    async fn notify_decision(&self, decision: &Decision) {
        let status = match decision.action {
            ApprovalAction::Approve => "Approved",
            ApprovalAction::Reject => "Rejected",
        };
        let subject = format!("EC2 Patching {} - {}", status, decision.execution_id);
        let message = format!(
            "Approval Decision Processed\n\n\
             Execution ID: {}\n\
             Action: {}\n\
             Status: {}\n\
             Timestamp: {}",
            decision.execution_id,
            decision.action.as_str().to_uppercase(),
            status,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        );

        if let Err(e) = self.notifier.publish(&subject, &message).await {
            tracing::warn!(error = %e, "Failed to send decision notification");
        }
    }
}

fn canonical_string(token: &str, timestamp: &str, action: ApprovalAction, execution_id: &str) -> String {
    format!("{}:{}:{}:{}", token, timestamp, action.as_str(), execution_id)
}

fn new_mac(key: &Secret<String>) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key.expose_secret().as_bytes())
        .map_err(|e| AppError::Config(format!("invalid signing key: {}", e)))
}

fn sign(key: &Secret<String>, canonical: &str) -> Result<String> {
    let mut mac = new_mac(key)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// 通知与日志中使用的短哈希
pub fn short_token_hash(token: &str) -> String {
    full_token_hash(token)[..8].to_string()
}

fn full_token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
