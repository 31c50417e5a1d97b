//! 外部协作方接口
//!
//! 身份服务、远程命令服务、密钥服务、工作流续接、通知渠道与问题分析助手都通过这里的 trait 接入。
//! `memory` 提供进程内模拟实现，用于本地运行与测试。

pub mod continuation;
pub mod memory;
pub mod notifier;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::approval::ContinuationOutcome;
use crate::models::command::{CommandRequest, Invocation};
use crate::models::credentials::Credentials;
use crate::models::patch::{InstanceInfo, PatchState};
use crate::models::target::{Region, RoleArn};

pub use continuation::InProcessContinuations;
pub use memory::{ScriptedAnalyst, SimulatedCloud};
pub use notifier::LogNotifier;

/// 角色扮演请求
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    pub role_arn: RoleArn,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_secs: u64,
}

/// 单次列举最多翻页数
pub const MAX_PAGES: usize = 1000;

/// 分页结果
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// 跨账号身份服务
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// 信任关系缺失或 external id 不匹配返回 `AccessDenied`，角色不存在返回 `RoleNotFound`
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credentials>;
}

/// 远程命令服务（目标账号内）
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// 创建命令，返回命令 ID
    async fn send_command(
        &self,
        credentials: &Credentials,
        region: &Region,
        request: &CommandRequest,
    ) -> Result<String>;

    /// 按幂等令牌查找已创建的命令
    async fn find_command_by_client_token(
        &self,
        credentials: &Credentials,
        region: &Region,
        client_token: &str,
    ) -> Result<Option<String>>;

    async fn list_command_invocations(
        &self,
        credentials: &Credentials,
        region: &Region,
        command_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<Invocation>>;

    async fn describe_instance_patch_states(
        &self,
        credentials: &Credentials,
        region: &Region,
        next_token: Option<String>,
    ) -> Result<Page<PatchState>>;

    async fn describe_instance_information(
        &self,
        credentials: &Credentials,
        region: &Region,
        next_token: Option<String>,
    ) -> Result<Page<InstanceInfo>>;
}

/// 密钥来源
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch_secret(&self, name: &str) -> Result<String>;
}

/// 工作流引擎的续接原语
#[async_trait]
pub trait ContinuationSink: Send + Sync {
    async fn send_outcome(&self, token: &str, outcome: ContinuationOutcome) -> Result<()>;
}

/// 通知渠道
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 返回消息 ID
    async fn publish(&self, subject: &str, message: &str) -> Result<String>;
}

/// 问题分析助手
#[async_trait]
pub trait IssueAnalyst: Send + Sync {
    /// 返回助手的原始回复文本
    async fn analyze(&self, session_id: &str, prompt: &str) -> Result<String>;
}
