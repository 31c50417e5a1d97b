//! 步骤处理器
//!
//! 供外部工作流引擎逐步调用。失败统一返回 `StepFailure` 结构，不抛出原始错误。

use axum::{
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::{
    context::CorrelationContext,
    error::AppError,
    extract::Payload,
    middleware::AppState,
    models::{
        analysis::{AnalysisReport, AnalysisRequest},
        approval::ApprovalRequest,
        steps::{
            ApprovalStepRequest, ApprovalStepResponse, DispatchStepRequest, DispatchStepResponse,
            InventorySummary, PollStepRequest, PollStepResponse, ScopeRequest, StepFailure,
            VerificationSummary,
        },
        target::{AccountId, Region, RoleArn, Target},
    },
    services::DispatchParams,
};

/// 步骤错误：渲染为 `StepFailure`
#[derive(Debug)]
pub struct StepError(pub AppError);

impl From<AppError> for StepError {
    fn from(e: AppError) -> Self {
        StepError(e)
    }
}

impl IntoResponse for StepError {
    fn into_response(self) -> Response {
        let failure = StepFailure::from(&self.0);
        if failure.status_code >= 500 {
            tracing::error!(error = %self.0, error_type = %failure.error_type, "Step failed");
        } else {
            tracing::warn!(error = %self.0, error_type = %failure.error_type, "Step rejected");
        }
        let status = StatusCode::from_u16(failure.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(failure)).into_response()
    }
}

/// 步骤请求体：解析失败同样渲染为 `StepFailure`
pub struct StepJson<T>(pub T);

impl<T, S> FromRequest<S> for StepJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = StepError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Payload(value) = Payload::<T>::from_request(req, state).await?;
        Ok(StepJson(value))
    }
}

type StepResult<T> = std::result::Result<Json<T>, StepError>;

fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, AppError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(message))
}

/// 下发补丁命令
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<DispatchStepRequest>,
) -> StepResult<DispatchStepResponse> {
    req.validate().map_err(AppError::from)?;
    let role_arn = RoleArn::parse(required(&req.role_arn, "roleArn and region are required")?)?;
    let region = Region::parse(required(&req.region, "roleArn and region are required")?)?;
    let ctx = ctx.with_execution(req.execution_id.clone());

    let credentials = state
        .broker
        .assume(&ctx, &role_arn, req.external_id.as_deref())
        .await?;
    let target = Target::new(role_arn.account_id().clone(), region);

    let params = DispatchParams {
        document_name: req.document_name,
        filters: req.targets,
        max_concurrency: req.max_concurrency,
        max_errors: req.max_errors,
        parameters: req.parameters.unwrap_or_default(),
        output_location: req.output_location,
        wave: req.wave,
    };
    let command_id = state.dispatcher.dispatch(&ctx, &credentials, &target, params).await?;

    Ok(Json(DispatchStepResponse {
        command_id,
        region: target.region.to_string(),
        account_id: target.account_id.to_string(),
    }))
}

/// 单次轮询命令状态
pub async fn poll(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<PollStepRequest>,
) -> StepResult<PollStepResponse> {
    req.validate().map_err(AppError::from)?;
    let message = "roleArn, region and commandId are required";
    let role_arn = RoleArn::parse(required(&req.role_arn, message)?)?;
    let region = Region::parse(required(&req.region, message)?)?;
    let command_id = required(&req.command_id, message)?.to_string();
    let account_id = match req.account_id.as_deref().filter(|a| !a.is_empty()) {
        Some(account) => AccountId::parse(account)?,
        None => role_arn.account_id().clone(),
    };
    let ctx = ctx.with_execution(req.execution_id.clone());

    let credentials = state
        .broker
        .assume(&ctx, &role_arn, req.external_id.as_deref())
        .await?;
    let result = state.poller.poll(&ctx, &credentials, &region, &command_id).await?;

    Ok(Json(PollStepResponse {
        result,
        command_id,
        region: region.to_string(),
        account_id: account_id.to_string(),
        execution_id: req.execution_id,
    }))
}

/// 补丁后校验
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<ScopeRequest>,
) -> StepResult<VerificationSummary> {
    let targets = req.targets()?;
    let ctx = ctx.with_execution(req.execution_id.clone());
    let summary = state
        .verification
        .verify_scope(&ctx, &targets, req.external_id.as_deref())
        .await;
    Ok(Json(summary))
}

/// 分析校验发现的问题
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<AnalysisRequest>,
) -> StepResult<AnalysisReport> {
    Ok(Json(state.analysis.analyze(&ctx, &req).await?))
}

/// 补丁前盘点
pub async fn inventory(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<ScopeRequest>,
) -> StepResult<InventorySummary> {
    let targets = req.targets()?;
    let ctx = ctx.with_execution(req.execution_id.clone());
    let summary = state
        .inventory
        .collect(&ctx, &targets, req.external_id.as_deref())
        .await;
    Ok(Json(summary))
}

/// 发起人工审批
pub async fn request_approval(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    StepJson(req): StepJson<ApprovalStepRequest>,
) -> StepResult<ApprovalStepResponse> {
    req.validate().map_err(AppError::from)?;
    let gate = state
        .gate
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("approval gate is disabled".to_string()))?;

    let ctx = ctx.with_execution(req.execution_id.clone());
    let execution_id = ctx.execution_id_or_default().to_string();
    let links = gate
        .request_approval(
            &ctx,
            ApprovalRequest {
                execution_id: execution_id.clone(),
                continuation_token: req.continuation_token,
                subject: req.subject,
                details: req.details,
                estimated_duration_minutes: req.estimated_duration_minutes,
            },
        )
        .await?;

    Ok(Json(ApprovalStepResponse {
        status: "approval_requested".to_string(),
        execution_id,
        token_hash: links.token_hash,
        approve_url_length: links.approve_url.len(),
        reject_url_length: links.reject_url.len(),
        notification_id: links.notification_id,
        expires_in_minutes: gate.expiry().as_secs() / 60,
    }))
}
