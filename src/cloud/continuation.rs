//! 进程内续接：挂起的步骤注册令牌并等待结果

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::ContinuationSink;
use crate::error::{AppError, Result};
use crate::models::approval::ContinuationOutcome;

#[derive(Default)]
pub struct InProcessContinuations {
    pending: DashMap<String, oneshot::Sender<ContinuationOutcome>>,
}

impl InProcessContinuations {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册挂起令牌，返回等待端
    pub fn register(&self, token: &str) -> oneshot::Receiver<ContinuationOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token.to_string(), tx);
        rx
    }

    /// 放弃等待（超时或执行结束）
    pub fn cancel(&self, token: &str) {
        self.pending.remove(token);
    }

    pub fn is_pending(&self, token: &str) -> bool {
        self.pending.contains_key(token)
    }
}

#[async_trait]
impl ContinuationSink for InProcessContinuations {
    async fn send_outcome(&self, token: &str, outcome: ContinuationOutcome) -> Result<()> {
        let (_, tx) = self
            .pending
            .remove(token)
            .ok_or_else(|| AppError::remote("TaskDoesNotExist", "continuation token is unknown or expired"))?;

        tx.send(outcome)
            .map_err(|_| AppError::remote("TaskTimedOut", "suspended step is no longer waiting"))
    }
}
