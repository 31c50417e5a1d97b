//! 完成状态轮询

use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use super::credential_broker::TargetSession;
use crate::cloud::{CommandBackend, MAX_PAGES};
use crate::config::PollerConfig;
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::command::{Invocation, PollResult};
use crate::models::credentials::Credentials;
use crate::models::target::Region;
use crate::retry::RetryPolicy;

pub struct CompletionPoller {
    backend: Arc<dyn CommandBackend>,
    retry: RetryPolicy,
    interval: Duration,
    max_polls: u32,
}

impl CompletionPoller {
    pub fn new(backend: Arc<dyn CommandBackend>, retry: RetryPolicy, config: &PollerConfig) -> Self {
        Self {
            backend,
            retry,
            interval: Duration::from_secs(config.interval_secs),
            max_polls: config.max_polls.max(1),
        }
    }

    /// 单次轮询：列出命令的全部调用（内部翻页）并分类汇总
    ///
    /// 无副作用，状态不变时重复调用结果相同。
    #[instrument(skip(self, ctx, credentials), fields(correlation_id = %ctx.correlation_id))]
    pub async fn poll(
        &self,
        ctx: &CorrelationContext,
        credentials: &Credentials,
        region: &Region,
        command_id: &str,
    ) -> Result<PollResult> {
        let mut invocations: Vec<Invocation> = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let token = next_token.take();
            let page = self
                .retry
                .run("list_command_invocations", ctx, |_| {
                    let backend = self.backend.clone();
                    let token = token.clone();
                    let region = region.clone();
                    let command_id = command_id.to_string();
                    async move {
                        backend
                            .list_command_invocations(credentials, &region, &command_id, token)
                            .await
                    }
                })
                .await?;

            invocations.extend(page.items);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        if next_token.is_some() {
            return Err(AppError::remote("PaginationLimitExceeded", "too many invocation pages"));
        }

        let result = PollResult::from_invocations(invocations);
        tracing::debug!(
            total = result.summary.total,
            completed = result.summary.completed,
            status = result.summary.overall_status.as_str(),
            all_done = result.all_done,
            "Command polled"
        );
        Ok(result)
    }

    /// 按固定间隔轮询直到全部结束；预算耗尽返回超时错误
    ///
    /// 每次轮询前从会话取凭证，轮询期间凭证到期会被续上。
    #[instrument(skip(self, ctx, session), fields(correlation_id = %ctx.correlation_id))]
    pub async fn poll_until_complete(
        &self,
        ctx: &CorrelationContext,
        session: &mut TargetSession<'_>,
        region: &Region,
        command_id: &str,
    ) -> Result<PollResult> {
        for attempt in 1..=self.max_polls {
            let credentials = session.fresh(ctx).await?;
            let result = self.poll(ctx, credentials, region, command_id).await?;
            if result.all_done {
                tracing::info!(
                    polls = attempt,
                    status = result.summary.overall_status.as_str(),
                    "Command reached terminal state"
                );
                return Ok(result);
            }
            if attempt < self.max_polls {
                tokio::time::sleep(self.interval).await;
            }
        }

        tracing::warn!(max_polls = self.max_polls, "Poll budget exhausted");
        Err(AppError::Timeout(format!(
            "command {} did not complete within {} polls",
            command_id, self.max_polls
        )))
    }
}
