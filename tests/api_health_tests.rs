//! 健康检查端点测试

use axum::http::StatusCode;

mod common;
use common::{create_test_app, create_test_config, send_json};

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app(create_test_config());

    let (status, body) = send_json(app.router(), "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ready_endpoint_with_memory_store() {
    let app = create_test_app(create_test_config());

    let (status, body) = send_json(app.router(), "GET", "/ready", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    let checks = body["checks"].as_array().unwrap();
    assert!(checks.iter().any(|c| c["name"] == "database"));
    assert!(checks
        .iter()
        .any(|c| c["name"] == "approval" && c["message"] == "enabled"));
}

#[tokio::test]
async fn test_ready_reports_disabled_approval() {
    let mut config = create_test_config();
    config.approval.enabled = false;
    let app = create_test_app(config);

    let (_, body) = send_json(app.router(), "GET", "/ready", None).await;

    let checks = body["checks"].as_array().unwrap();
    assert!(checks
        .iter()
        .any(|c| c["name"] == "approval" && c["message"] == "disabled"));
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let app = create_test_app(create_test_config());

    let (status, _) = send_json(app.router(), "GET", "/nonexistent", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
