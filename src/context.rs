//! 关联上下文
//!
//! 每个步骤显式接收并向下传递，不依赖全局日志状态。

use axum::http::HeaderMap;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
/// 与审计表 correlation_id 列宽一致
pub const MAX_CORRELATION_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub execution_id: Option<String>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            execution_id: None,
        }
    }

    pub fn for_execution(execution_id: &str) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            execution_id: Some(execution_id.to_string()),
        }
    }

    /// 从请求头提取关联 ID，缺失或非法时生成新的
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= MAX_CORRELATION_ID_LEN)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            correlation_id,
            execution_id: None,
        }
    }

    pub fn with_execution(mut self, execution_id: Option<String>) -> Self {
        if execution_id.is_some() {
            self.execution_id = execution_id;
        }
        self
    }

    pub fn execution_id_or_default(&self) -> &str {
        self.execution_id.as_deref().unwrap_or("unknown")
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("abc-123"));
        let ctx = CorrelationContext::from_headers(&headers);
        assert_eq!(ctx.correlation_id, "abc-123");

        let ctx = CorrelationContext::from_headers(&HeaderMap::new());
        assert!(!ctx.correlation_id.is_empty());
    }

    #[test]
    fn test_overlong_correlation_id_is_replaced() {
        let mut headers = HeaderMap::new();
        let exact = "a".repeat(MAX_CORRELATION_ID_LEN);
        headers.insert(CORRELATION_HEADER, HeaderValue::from_str(&exact).unwrap());
        assert_eq!(CorrelationContext::from_headers(&headers).correlation_id, exact);

        let long = "a".repeat(MAX_CORRELATION_ID_LEN + 1);
        headers.insert(CORRELATION_HEADER, HeaderValue::from_str(&long).unwrap());
        let ctx = CorrelationContext::from_headers(&headers);
        assert_ne!(ctx.correlation_id, long);
        assert!(ctx.correlation_id.len() <= MAX_CORRELATION_ID_LEN);
    }

    #[test]
    fn test_with_execution_keeps_existing() {
        let ctx = CorrelationContext::for_execution("exec-1").with_execution(None);
        assert_eq!(ctx.execution_id.as_deref(), Some("exec-1"));
        let ctx = ctx.with_execution(Some("exec-2".into()));
        assert_eq!(ctx.execution_id_or_default(), "exec-2");
    }
}
