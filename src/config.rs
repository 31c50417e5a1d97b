//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::time::Duration;

use crate::models::execution::AbortPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（未配置时使用内存记录存储）
    pub url: Option<Secret<String>>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

/// 制品存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub region: String,
    /// 自定义端点（MinIO 等兼容服务）
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<Secret<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// 默认远程命令文档
    pub document_name: String,
    pub max_concurrency: String,
    pub max_errors: String,
    /// 目标账号中的执行角色名
    pub role_name: String,
    pub external_id: Option<String>,
    /// 临时凭证有效期（秒），上限 1 小时
    pub session_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    pub interval_secs: u64,
    pub max_polls: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    pub enabled: bool,
    /// 回调基础地址，例如 "https://ops.example.com"
    pub callback_base_url: String,
    /// 审批链接有效期（分钟）
    pub expiry_minutes: u64,
    /// HMAC 签名密钥（使用 Secret 包装，防止日志泄露）
    pub signing_secret: Option<Secret<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub max_parallel_targets: usize,
    /// 单次调用内允许的最长波次间隔（秒），超过则挂起并返回检查点
    pub max_inline_pause_secs: u64,
    pub abort_policy: AbortPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub state_ttl_days: i64,
    pub audit_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub poller: PollerConfig,
    pub approval: ApprovalConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("storage.backend", "memory")?
            .set_default("storage.bucket", "patch-orchestrator-artifacts")?
            .set_default("storage.region", "us-east-1")?
            .set_default("dispatch.document_name", "AWS-RunPatchBaseline")?
            .set_default("dispatch.max_concurrency", "10%")?
            .set_default("dispatch.max_errors", "1")?
            .set_default("dispatch.role_name", "PatchExecRole")?
            .set_default("dispatch.session_duration_secs", 3600)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.base_delay_ms", 1000)?
            .set_default("retry.backoff_factor", 2.0)?
            .set_default("poller.interval_secs", 30)?
            .set_default("poller.max_polls", 120)?
            .set_default("approval.enabled", true)?
            .set_default("approval.callback_base_url", "http://localhost:3000")?
            .set_default("approval.expiry_minutes", 60)?
            .set_default("scheduler.max_parallel_targets", 10)?
            .set_default("scheduler.max_inline_pause_secs", 900)?
            .set_default("scheduler.abort_policy", "require_approval")?
            .set_default("retention.state_ttl_days", 90)?
            .set_default("retention.audit_ttl_days", 365)?;

        // 从环境变量加载配置（前缀为 PATCH_）
        settings = settings.add_source(
            Environment::with_prefix("PATCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        // 临时凭证有效期 15 分钟到 1 小时
        if !(900..=3600).contains(&self.dispatch.session_duration_secs) {
            return Err(ConfigError::Message(
                "session_duration_secs must be between 900 and 3600".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message("retry.max_attempts must be >= 1".to_string()));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Message("retry.backoff_factor must be >= 1.0".to_string()));
        }

        if self.poller.max_polls == 0 {
            return Err(ConfigError::Message("poller.max_polls must be >= 1".to_string()));
        }

        if self.approval.expiry_minutes == 0 {
            return Err(ConfigError::Message(
                "approval.expiry_minutes must be >= 1".to_string(),
            ));
        }

        // 验证签名密钥长度（至少 32 字符）
        if let Some(secret) = &self.approval.signing_secret {
            if secret.expose_secret().len() < 32 {
                return Err(ConfigError::Message(
                    "approval signing secret must be at least 32 characters long".to_string(),
                ));
            }
        }

        if self.scheduler.max_parallel_targets == 0 {
            return Err(ConfigError::Message(
                "scheduler.max_parallel_targets must be >= 1".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_empty() {
            return Err(ConfigError::Message("storage.bucket is required for s3".to_string()));
        }

        Ok(())
    }

    pub fn approval_expiry(&self) -> Duration {
        Duration::from_secs(self.approval.expiry_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_secs)
    }
}
