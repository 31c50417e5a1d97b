//! 远程命令下发
//!
//! 每次下发携带由 (执行, 账号, 区域, 波次) 派生的幂等令牌。
//! 重试前先按令牌查询，已创建的命令直接沿用，不重复下发。

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::cloud::CommandBackend;
use crate::config::DispatchConfig;
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::command::{CommandRequest, OutputLocation, TargetFilter};
use crate::models::credentials::Credentials;
use crate::models::target::Target;
use crate::retry::RetryPolicy;

/// 未指定过滤条件时选择目标内全部托管实例
const ALL_INSTANCES_KEY: &str = "InstanceIds";

/// 下发参数，未设置的字段使用配置默认值
#[derive(Debug, Clone, Default)]
pub struct DispatchParams {
    pub document_name: Option<String>,
    pub filters: Vec<TargetFilter>,
    pub max_concurrency: Option<String>,
    pub max_errors: Option<String>,
    pub parameters: HashMap<String, Vec<String>>,
    pub output_location: Option<OutputLocation>,
    pub wave: Option<usize>,
}

pub struct CommandDispatcher {
    backend: Arc<dyn CommandBackend>,
    retry: RetryPolicy,
    defaults: DispatchConfig,
}

impl CommandDispatcher {
    pub fn new(backend: Arc<dyn CommandBackend>, retry: RetryPolicy, defaults: DispatchConfig) -> Self {
        Self {
            backend,
            retry,
            defaults,
        }
    }

    /// 下发命令并立即返回命令 ID，不等待完成
    #[instrument(skip(self, ctx, credentials, params), fields(target = %target, correlation_id = %ctx.correlation_id))]
    pub async fn dispatch(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        target: &Target,
        params: DispatchParams,
    ) -> Result<String> {
        if credentials.account_id != target.account_id {
            return Err(AppError::Validation(format!(
                "credentials for {} cannot dispatch to {}",
                credentials.account_id, target.account_id
            )));
        }

        let request = self.build_request(ctx, target, params);
        let client_token = request.client_token.clone();

        let command_id = self
            .retry
            .run("send_command", ctx, |attempt| {
                let backend = self.backend.clone();
                let request = request.clone();
                let region = target.region.clone();
                async move {
                    if attempt > 0 {
                        // 上一次可能已在服务端创建成功
                        if let Some(existing) = backend
                            .find_command_by_client_token(credentials, &region, &request.client_token)
                            .await?
                        {
                            tracing::warn!(
                                command_id = %existing,
                                attempt,
                                "Adopting command created by an earlier attempt"
                            );
                            return Ok(existing);
                        }
                    }
                    backend.send_command(credentials, &region, &request).await
                }
            })
            .await?;

        if command_id.is_empty() {
            return Err(AppError::remote("InvalidResponse", "send command returned an empty command id"));
        }

        tracing::info!(
            command_id = %command_id,
            document = %request.document_name,
            client_token = %client_token,
            "Command dispatched"
        );
        Ok(command_id)
    }

    fn build_request(&self, ctx: &CorrelationContext, target: &Target, params: DispatchParams) -> CommandRequest {
        let filters = if params.filters.is_empty() {
            vec![TargetFilter {
                key: ALL_INSTANCES_KEY.to_string(),
                values: vec!["*".to_string()],
            }]
        } else {
            params.filters
        };

        CommandRequest {
            document_name: params
                .document_name
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| self.defaults.document_name.clone()),
            filters,
            max_concurrency: params
                .max_concurrency
                .unwrap_or_else(|| self.defaults.max_concurrency.clone()),
            max_errors: params.max_errors.unwrap_or_else(|| self.defaults.max_errors.clone()),
            parameters: params.parameters,
            output_location: params.output_location,
            client_token: idempotency_token(ctx, target, params.wave),
        }
    }
}

/// 同一执行、目标与波次总是得到同一令牌
pub fn idempotency_token(ctx: &CorrelationContext, target: &Target, wave: Option<usize>) -> String {
    let scope = ctx.execution_id.as_deref().unwrap_or(&ctx.correlation_id);
    let wave = wave.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string());

    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}:{}", scope, target.account_id, target.region, wave).as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}
