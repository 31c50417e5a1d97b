//! 审批回调处理器
//! 面向人工点击的链接，返回简单的确认页面

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    context::CorrelationContext,
    error::AppError,
    middleware::AppState,
    models::approval::{ApprovalAction, CallbackMeta, CallbackQuery},
};

/// 处理批准/拒绝链接
pub async fn approval_callback(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<CorrelationContext>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(gate) = state.gate.as_ref() else {
        return render(StatusCode::BAD_REQUEST, Page::Error("Approval is not enabled".to_string()));
    };

    let meta = CallbackMeta {
        source_ip: client_ip(&headers),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    match gate.resolve(&ctx, query, meta).await {
        Ok(decision) => render(StatusCode::OK, Page::Resolved(decision.action)),
        Err(e) => {
            tracing::warn!(error = %e, "Approval callback rejected");
            let status = match &e {
                AppError::ApprovalRejected(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
                AppError::AlreadyResolved(_) => StatusCode::CONFLICT,
                AppError::Remote { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            render(status, Page::Error(e.user_message()))
        }
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
}

enum Page {
    Resolved(ApprovalAction),
    Error(String),
}

fn render(status: StatusCode, page: Page) -> Response {
    let (title, message, color) = match page {
        Page::Resolved(ApprovalAction::Approve) => (
            "Approved Successfully".to_string(),
            "The patching operation has been approved and will now continue.".to_string(),
            "#28a745",
        ),
        Page::Resolved(ApprovalAction::Reject) => (
            "Rejected Successfully".to_string(),
            "The patching operation has been rejected and will not proceed.".to_string(),
            "#dc3545",
        ),
        Page::Error(reason) => (
            "Error Processing Request".to_string(),
            format!("Your request could not be processed: {}", escape(&reason)),
            "#ffc107",
        ),
    };

    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Approval Result</title>\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\"></head>\n\
         <body style=\"font-family: Arial, sans-serif; max-width: 600px; margin: 50px auto; text-align: center;\">\n\
         <h2 style=\"color: {color};\">{title}</h2>\n<p>{message}</p>\n\
         <p style=\"font-size: 12px; color: #999;\">Processed at: {time}</p>\n</body>\n</html>",
        color = color,
        title = title,
        message = message,
        time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    );

    (status, [(header::CACHE_CONTROL, "no-cache")], Html(body)).into_response()
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));
        assert!(client_ip(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_error_message_is_escaped() {
        assert_eq!(escape("<script>"), "&lt;script&gt;");
    }
}
