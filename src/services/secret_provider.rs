//! 审批签名密钥提供者
//!
//! 进程生命周期内最多读取一次，并发首次读取合并为一次。
//! 读取后不可刷新，否则已签发且未过期的链接全部失效。

use secrecy::Secret;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::cloud::SecretSource;
use crate::error::{AppError, Result};

pub struct SecretProvider {
    source: Option<Arc<dyn SecretSource>>,
    secret_name: String,
    cached: OnceCell<Secret<String>>,
}

impl SecretProvider {
    pub fn new(source: Arc<dyn SecretSource>, secret_name: &str) -> Self {
        Self {
            source: Some(source),
            secret_name: secret_name.to_string(),
            cached: OnceCell::new(),
        }
    }

    /// 未配置签名密钥：链接不签名，回调一律拒绝
    pub fn disabled() -> Self {
        Self {
            source: None,
            secret_name: String::new(),
            cached: OnceCell::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// 获取签名密钥；未启用时返回 `None`
    pub async fn signing_key(&self) -> Result<Option<&Secret<String>>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };

        let secret = self
            .cached
            .get_or_try_init(|| async {
                let raw = source.fetch_secret(&self.secret_name).await?;
                let value = parse_secret_value(&raw)?;
                tracing::info!(secret = %self.secret_name, "Approval signing secret loaded");
                Ok::<_, AppError>(Secret::new(value))
            })
            .await?;

        Ok(Some(secret))
    }
}

/// 支持纯文本，或 `{"secret": ...}` / `{"value": ...}` 形式的 JSON
fn parse_secret_value(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => map
            .get("secret")
            .or_else(|| map.get("value"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| AppError::Config("signing secret JSON has no secret/value field".into()))?,
        _ => trimmed.to_string(),
    };

    if value.is_empty() {
        return Err(AppError::Config("signing secret is empty".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::StaticSecretSource;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_secret_value() {
        assert_eq!(parse_secret_value("plain-secret").unwrap(), "plain-secret");
        assert_eq!(parse_secret_value(r#"{"secret":"abc"}"#).unwrap(), "abc");
        assert_eq!(parse_secret_value(r#"{"value":"xyz"}"#).unwrap(), "xyz");
        assert!(parse_secret_value(r#"{"other":"x"}"#).is_err());
        assert!(parse_secret_value("  ").is_err());
    }

    #[tokio::test]
    async fn test_fetched_once_under_concurrency() {
        let source = Arc::new(StaticSecretSource::new("0123456789abcdef0123456789abcdef"));
        let provider = Arc::new(SecretProvider::new(source.clone(), "approval-signing"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.signing_key().await.unwrap().map(|s| s.expose_secret().len())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(32));
        }
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_disabled_provider() {
        let provider = SecretProvider::disabled();
        assert!(!provider.is_enabled());
        assert!(provider.signing_key().await.unwrap().is_none());
    }
}
