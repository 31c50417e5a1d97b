//! 测试公共模块
//! 提供测试配置与完全基于内存的应用状态

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use patch_orchestrator::{
    cloud::{memory::StaticSecretSource, notifier::MemoryNotifier, ScriptedAnalyst, SecretSource, SimulatedCloud},
    config::{
        AppConfig, ApprovalConfig, DatabaseConfig, DispatchConfig, LoggingConfig, PollerConfig,
        RetentionConfig, RetryConfig, SchedulerConfig, ServerConfig, StorageBackend, StorageConfig,
    },
    middleware::{AppState, Collaborators},
    models::{execution::AbortPolicy, patch::PatchState},
    repository::{MemoryBlobStore, MemoryRecordStore},
    routes,
};
use secrecy::Secret;
use std::sync::Arc;
use tower::ServiceExt;

pub const SIGNING_KEY: &str = "test-signing-key-for-approval-links-0001";

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(), // 使用随机端口
            graceful_shutdown_timeout_secs: 5,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            bucket: "test-artifacts".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        },
        dispatch: DispatchConfig {
            document_name: "AWS-RunPatchBaseline".to_string(),
            max_concurrency: "10%".to_string(),
            max_errors: "1".to_string(),
            role_name: "PatchExecRole".to_string(),
            external_id: None,
            session_duration_secs: 3600,
        },
        // 测试中重试不等待
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 0,
            backoff_factor: 2.0,
        },
        poller: PollerConfig {
            interval_secs: 0,
            max_polls: 5,
        },
        approval: ApprovalConfig {
            enabled: true,
            callback_base_url: "https://ops.example.com".to_string(),
            expiry_minutes: 60,
            signing_secret: Some(Secret::new(SIGNING_KEY.to_string())),
        },
        scheduler: SchedulerConfig {
            max_parallel_targets: 4,
            max_inline_pause_secs: 60,
            abort_policy: AbortPolicy::RequireApproval,
        },
        retention: RetentionConfig {
            state_ttl_days: 90,
            audit_ttl_days: 365,
        },
    }
}

/// 测试应用：状态 + 可编排的内存协作方
pub struct TestApp {
    pub state: Arc<AppState>,
    pub cloud: Arc<SimulatedCloud>,
    pub notifier: Arc<MemoryNotifier>,
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub analyst: Arc<ScriptedAnalyst>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone())
    }
}

/// 创建测试应用状态
pub fn create_test_app(config: AppConfig) -> TestApp {
    let cloud = Arc::new(SimulatedCloud::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let records = Arc::new(MemoryRecordStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let analyst = Arc::new(ScriptedAnalyst::new());
    let secrets = config
        .approval
        .signing_secret
        .as_ref()
        .map(|_| Arc::new(StaticSecretSource::new(SIGNING_KEY)) as Arc<dyn SecretSource>);

    let state = Arc::new(AppState::build(
        config,
        None,
        Collaborators {
            assumer: cloud.clone(),
            backend: cloud.clone(),
            secrets,
            notifier: notifier.clone(),
            blobs: blobs.clone(),
            records: records.clone(),
            analyst: Some(analyst.clone()),
        },
    ));

    TestApp {
        state,
        cloud,
        notifier,
        records,
        blobs,
        analyst,
    }
}

pub fn patch_state(instance_id: &str, missing: u32, failed: u32) -> PatchState {
    PatchState {
        instance_id: instance_id.to_string(),
        missing_count: missing,
        failed_count: failed,
        installed_count: 12,
        installed_pending_reboot_count: 0,
        operation: Some("Install".to_string()),
    }
}

/// 发送 JSON 请求并返回状态码与解析后的响应体
pub async fn send_json(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// GET 请求，返回状态码与文本响应体
pub async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}
