//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{handlers, middleware::AppState};

/// 请求体上限
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 工作流步骤
    let step_routes = Router::new()
        .route("/api/v1/steps/inventory", post(handlers::steps::inventory))
        .route("/api/v1/steps/dispatch", post(handlers::steps::dispatch))
        .route("/api/v1/steps/poll", post(handlers::steps::poll))
        .route("/api/v1/steps/verify", post(handlers::steps::verify))
        .route("/api/v1/steps/analyze", post(handlers::steps::analyze))
        .route("/api/v1/steps/approval", post(handlers::steps::request_approval));

    // 执行管理
    let execution_routes = Router::new()
        .route("/api/v1/executions", post(handlers::execution::create_execution))
        .route("/api/v1/executions/{id}", get(handlers::execution::get_execution))
        .route(
            "/api/v1/executions/{id}/resume",
            post(handlers::execution::resume_execution),
        )
        .route(
            "/api/v1/executions/{id}/audit",
            get(handlers::execution::get_execution_audit),
        );

    // 审批回调（人工点击的链接）
    let callback_routes = Router::new().route("/callback", get(handlers::callback::approval_callback));

    Router::new()
        .merge(public_routes)
        .merge(step_routes)
        .merge(execution_routes)
        .merge(callback_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
