//! 通知渠道实现

use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

use super::Notifier;
use crate::error::{AppError, Result};

/// 只写日志的通知器；消息正文含签名链接，不落日志
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(
            subject,
            message_id = %message_id,
            message_length = message.len(),
            "Notification published"
        );
        Ok(message_id)
    }
}

/// 记录所有消息的通知器
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<String> {
        self.messages
            .lock()
            .map_err(|_| AppError::internal_error("notifier lock poisoned"))?
            .push((subject.to_string(), message.to_string()));
        Ok(Uuid::new_v4().to_string())
    }
}
