//! 统一错误模型
//! 定义所有错误类型、重试分类和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 可重试的远端错误码（限流、内部错误、服务不可用）
const RETRYABLE_REMOTE_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "InternalError",
    "InternalServerError",
    "ServiceUnavailable",
];

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Remote call failed [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 审批回调请求本身被拒绝（签名错误、过期等），不影响挂起的执行
    #[error("Approval request rejected: {0}")]
    ApprovalRejected(String),

    #[error("Continuation already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ApprovalRejected(_) | AppError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::RoleNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyResolved(_) => StatusCode::CONFLICT,
            AppError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Remote { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::Storage(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 结构化错误码
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::AccessDenied(_) => "ACCESS_DENIED",
            AppError::RoleNotFound(_) => "ROLE_NOT_FOUND",
            AppError::Throttled(_) => "THROTTLED",
            AppError::Remote { .. } => "REMOTE_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::ApprovalRejected(_) => "APPROVAL_REQUEST_REJECTED",
            AppError::AlreadyResolved(_) => "ALREADY_RESOLVED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::AccessDenied(_) => "Access denied".to_string(),
            AppError::RoleNotFound(_) => "Execution role not found".to_string(),
            AppError::Throttled(_) => "Rate limit exceeded".to_string(),
            AppError::Remote { code, .. } => format!("Remote call failed: {}", code),
            AppError::Timeout(msg) => format!("Timeout: {}", msg),
            AppError::ApprovalRejected(msg) => msg.clone(),
            AppError::AlreadyResolved(_) => "This approval has already been processed".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Storage(_) => "Storage error occurred".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 是否为可重试错误
    ///
    /// 限流与瞬时服务端错误可重试；权限、资源不存在、参数错误等立即失败。
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Throttled(_) => true,
            AppError::Remote { code, .. } => RETRYABLE_REMOTE_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// 错误类型名（用于步骤失败响应的 error_type 字段）
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => "ValidationError",
            AppError::AccessDenied(_) => "AccessDenied",
            AppError::RoleNotFound(_) => "RoleNotFound",
            AppError::Throttled(_) => "ThrottledError",
            AppError::ApprovalRejected(_) | AppError::AlreadyResolved(_) => "ApprovalCallbackError",
            AppError::Internal(_) => "UnexpectedError",
            _ => "StepError",
        }
    }

    // 便捷方法
    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn storage(msg: &str) -> Self {
        AppError::Storage(msg.to_string())
    }

    pub fn remote(code: &str, message: &str) -> Self {
        AppError::Remote {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn timeout(msg: &str) -> Self {
        AppError::Timeout(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        // 记录错误日志
        tracing::error!(
            code = self.code(),
            message = %self,
            request_id = %error_response.error.request_id,
            "Application error"
        );

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {}", e))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(AppError::AccessDenied("x".into()).code(), "ACCESS_DENIED");
        assert_eq!(AppError::AlreadyResolved("t".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::Throttled("x".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Throttled("sts".into()).is_retryable());
        assert!(AppError::remote("RequestLimitExceeded", "slow down").is_retryable());
        assert!(AppError::remote("ServiceUnavailable", "").is_retryable());
        assert!(!AppError::remote("AccessDeniedException", "").is_retryable());
        assert!(!AppError::remote("InvalidParameterValue", "").is_retryable());
        assert!(!AppError::remote("TaskDoesNotExist", "").is_retryable());
        assert!(!AppError::AccessDenied("role".into()).is_retryable());
        assert!(!AppError::validation("bad account").is_retryable());
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let denied = AppError::AccessDenied("arn:aws:iam::123456789012:role/PatchExecRole".into());
        assert!(!denied.user_message().contains("arn"));
    }
}
