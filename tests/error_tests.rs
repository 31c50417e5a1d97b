//! 错误映射测试

use axum::{http::StatusCode, response::IntoResponse};
use http_body_util::BodyExt;
use patch_orchestrator::{error::AppError, models::steps::StepFailure};

#[test]
fn test_status_codes() {
    assert_eq!(AppError::validation("x").status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(AppError::not_found("x").status_code(), StatusCode::NOT_FOUND);
    assert_eq!(AppError::AccessDenied("x".into()).status_code(), StatusCode::FORBIDDEN);
    assert_eq!(AppError::AlreadyResolved("x".into()).status_code(), StatusCode::CONFLICT);
    assert_eq!(AppError::Throttled("x".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(AppError::timeout("x").status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(AppError::remote("InternalError", "x").status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        AppError::internal_error("x").status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_retryable_classification() {
    assert!(AppError::Throttled("rate".into()).is_retryable());
    assert!(AppError::remote("ThrottlingException", "x").is_retryable());
    assert!(AppError::remote("ServiceUnavailable", "x").is_retryable());

    assert!(!AppError::remote("InvalidParameterValue", "x").is_retryable());
    assert!(!AppError::AccessDenied("x".into()).is_retryable());
    assert!(!AppError::RoleNotFound("x".into()).is_retryable());
    assert!(!AppError::validation("x").is_retryable());
}

#[test]
fn test_user_message_hides_internals() {
    let err = AppError::AccessDenied("arn:aws:iam::123456789012:role/Secret".into());
    assert_eq!(err.user_message(), "Access denied");

    let err = AppError::internal_error("pool exhausted at 10.0.0.5");
    assert!(!err.user_message().contains("10.0.0.5"));
}

#[test]
fn test_step_failure_shape() {
    let failure = StepFailure::from(&AppError::validation("roleArn and region are required"));

    assert_eq!(failure.status_code, 400);
    assert!(!failure.success);
    assert_eq!(failure.error, "roleArn and region are required");
    assert_eq!(failure.error_type, "ValidationError");

    let failure = StepFailure::from(&AppError::internal_error("boom"));
    assert_eq!(failure.status_code, 500);
    assert_eq!(failure.error_type, "UnexpectedError");
}

#[tokio::test]
async fn test_error_response_body() {
    let response = AppError::not_found("execution exec-1").into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(body["error"]["message"], "Resource not found: execution exec-1");
    assert!(body["error"]["request_id"].is_string());
}
