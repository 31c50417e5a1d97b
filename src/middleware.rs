//! HTTP 中间件与应用状态
//! 关联 ID 传递、请求追踪

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use crate::cloud::{CommandBackend, InProcessContinuations, IssueAnalyst, Notifier, RoleAssumer, SecretSource};
use crate::config::AppConfig;
use crate::context::{CorrelationContext, CORRELATION_HEADER};
use crate::repository::{BlobStore, RecordStore};
use crate::retry::RetryPolicy;
use crate::services::{
    ApprovalGate, AuditService, CommandDispatcher, CompletionPoller, CredentialBroker, InventoryService,
    IssueAnalysisService, SchedulerSettings, SecretProvider, VerificationService, WaveScheduler,
};

/// 签名密钥在密钥来源中的名称
pub const SIGNING_SECRET_NAME: &str = "approval-signing-secret";

/// 外部协作方
pub struct Collaborators {
    pub assumer: Arc<dyn RoleAssumer>,
    pub backend: Arc<dyn CommandBackend>,
    /// 未提供时审批链接不签名
    pub secrets: Option<Arc<dyn SecretSource>>,
    pub notifier: Arc<dyn Notifier>,
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    /// 未提供时分析步骤只处理无问题的情况
    pub analyst: Option<Arc<dyn IssueAnalyst>>,
}

/// 应用状态
///
/// 服务都用 Arc 包装，请求之间共享。
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Option<sqlx::PgPool>,
    pub broker: Arc<CredentialBroker>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub poller: Arc<CompletionPoller>,
    pub verification: Arc<VerificationService>,
    pub inventory: Arc<InventoryService>,
    pub analysis: Arc<IssueAnalysisService>,
    /// 审批关闭时为 None
    pub gate: Option<Arc<ApprovalGate>>,
    pub scheduler: Arc<WaveScheduler>,
    pub audit: Arc<AuditService>,
}

impl AppState {
    /// 按配置装配全部服务
    pub fn build(config: AppConfig, db: Option<sqlx::PgPool>, deps: Collaborators) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let state_ttl = config.retention.state_ttl_days;

        let audit = Arc::new(AuditService::new(deps.records.clone(), config.retention.audit_ttl_days));
        let broker = Arc::new(CredentialBroker::new(deps.assumer, retry.clone(), &config.dispatch));
        let dispatcher = Arc::new(CommandDispatcher::new(
            deps.backend.clone(),
            retry.clone(),
            config.dispatch.clone(),
        ));
        let poller = Arc::new(CompletionPoller::new(deps.backend.clone(), retry.clone(), &config.poller));
        let verification = Arc::new(VerificationService::new(
            broker.clone(),
            deps.backend.clone(),
            retry.clone(),
            deps.blobs.clone(),
            deps.records.clone(),
            state_ttl,
        ));
        let inventory = Arc::new(InventoryService::new(
            broker.clone(),
            deps.backend,
            retry.clone(),
            deps.blobs,
            deps.records.clone(),
            state_ttl,
        ));

        let analysis = Arc::new(IssueAnalysisService::new(deps.analyst, retry.clone()));

        let continuations = Arc::new(InProcessContinuations::new());
        let gate = config.approval.enabled.then(|| {
            let secrets = match deps.secrets {
                Some(source) => SecretProvider::new(source, SIGNING_SECRET_NAME),
                None => SecretProvider::disabled(),
            };
            Arc::new(ApprovalGate::new(
                Arc::new(secrets),
                deps.notifier,
                continuations.clone(),
                deps.records,
                audit.clone(),
                retry,
                &config.approval.callback_base_url,
                config.approval_expiry(),
            ))
        });

        let scheduler = Arc::new(WaveScheduler::new(
            broker.clone(),
            dispatcher.clone(),
            poller.clone(),
            verification.clone(),
            gate.clone(),
            continuations,
            audit.clone(),
            SchedulerSettings::from_config(&config),
        ));

        Self {
            config,
            db,
            broker,
            dispatcher,
            poller,
            verification,
            inventory,
            analysis,
            gate,
            scheduler,
            audit,
        }
    }
}

/// 请求追踪中间件
/// 提取或生成关联 ID，放入请求扩展并回写到响应头，同时记录指标
pub async fn request_tracking_middleware(mut req: Request, next: Next) -> Response {
    let ctx = CorrelationContext::from_headers(req.headers());
    let correlation_id = ctx.correlation_id.clone();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    req.extensions_mut().insert(ctx);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        let status = response.status();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            _ => "OTHER",
        };
        metrics::counter!(
            "http_requests_total",
            "method" => method_name,
            "status" => status_class(status)
        )
        .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(CORRELATION_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(StatusCode::OK), "2xx");
        assert_eq!(status_class(StatusCode::ACCEPTED), "2xx");
        assert_eq!(status_class(StatusCode::CONFLICT), "4xx");
        assert_eq!(status_class(StatusCode::BAD_GATEWAY), "5xx");
    }
}
