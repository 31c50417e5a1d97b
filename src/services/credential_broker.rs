//! 凭证代理：为目标账号换取短期执行凭证

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::instrument;

use crate::cloud::{AssumeRoleRequest, RoleAssumer};
use crate::config::DispatchConfig;
use crate::context::CorrelationContext;
use crate::error::Result;
use crate::models::credentials::{Credentials, MAX_SESSION_SECS};
use crate::models::target::{AccountId, RoleArn};
use crate::retry::RetryPolicy;

/// 会话名最大长度
const MAX_SESSION_NAME_LEN: usize = 64;
/// 剩余有效期低于此值时刷新
const REFRESH_MARGIN_SECS: i64 = 120;

pub struct CredentialBroker {
    assumer: Arc<dyn RoleAssumer>,
    retry: RetryPolicy,
    role_name: String,
    default_external_id: Option<String>,
    session_duration_secs: u64,
}

impl CredentialBroker {
    pub fn new(assumer: Arc<dyn RoleAssumer>, retry: RetryPolicy, config: &DispatchConfig) -> Self {
        Self {
            assumer,
            retry,
            role_name: config.role_name.clone(),
            default_external_id: config.external_id.clone().filter(|id| !id.is_empty()),
            session_duration_secs: config.session_duration_secs.min(MAX_SESSION_SECS),
        }
    }

    pub fn role_arn_for(&self, account_id: &AccountId) -> RoleArn {
        RoleArn::for_account(account_id, &self.role_name)
    }

    /// 扮演目标账号的执行角色
    ///
    /// 凭证只用于当前目标的流水线，不缓存。
    #[instrument(skip(self, ctx, external_id), fields(account_id = %role_arn.account_id(), correlation_id = %ctx.correlation_id))]
    pub async fn assume(
        &self,
        ctx: &CorrelationContext,
        role_arn: &RoleArn,
        external_id: Option<&str>,
    ) -> Result<Credentials> {
        let external_id = external_id
            .filter(|id| !id.is_empty())
            .map(String::from)
            .or_else(|| self.default_external_id.clone());

        let credentials = self
            .retry
            .run("assume_role", ctx, |_| {
                let request = AssumeRoleRequest {
                    role_arn: role_arn.clone(),
                    session_name: session_name(ctx),
                    external_id: external_id.clone(),
                    duration_secs: self.session_duration_secs,
                };
                let assumer = self.assumer.clone();
                async move { assumer.assume_role(&request).await }
            })
            .await?;

        tracing::info!(expiration = %credentials.expiration, "Execution role assumed");
        Ok(credentials)
    }

    pub async fn assume_for_account(
        &self,
        ctx: &CorrelationContext,
        account_id: &AccountId,
        external_id: Option<&str>,
    ) -> Result<Credentials> {
        self.assume(ctx, &self.role_arn_for(account_id), external_id).await
    }

    /// 为单个目标的流水线开启凭证会话
    pub async fn open_session(
        &self,
        ctx: &CorrelationContext,
        account_id: &AccountId,
        external_id: Option<&str>,
    ) -> Result<TargetSession<'_>> {
        let credentials = self.assume_for_account(ctx, account_id, external_id).await?;
        Ok(TargetSession {
            broker: self,
            account_id: account_id.clone(),
            external_id: external_id.map(String::from),
            credentials,
        })
    }
}

/// 单目标流水线持有的凭证
///
/// 每次远程调用前经 `fresh` 取用，临近过期时重新扮演角色，过期凭证不会被再次使用。
pub struct TargetSession<'a> {
    broker: &'a CredentialBroker,
    account_id: AccountId,
    external_id: Option<String>,
    credentials: Credentials,
}

impl TargetSession<'_> {
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub async fn fresh(&mut self, ctx: &CorrelationContext) -> Result<&Credentials> {
        let deadline = Utc::now() + Duration::seconds(REFRESH_MARGIN_SECS);
        if self.credentials.is_expired_at(deadline) {
            tracing::info!(
                account_id = %self.account_id,
                expiration = %self.credentials.expiration,
                "Credentials near expiry, re-assuming role"
            );
            self.credentials = self
                .broker
                .assume_for_account(ctx, &self.account_id, self.external_id.as_deref())
                .await?;
        }
        Ok(&self.credentials)
    }
}

/// 审计可关联（执行 ID）且每次调用唯一（毫秒时间戳）
pub fn session_name(ctx: &CorrelationContext) -> String {
    let raw = format!(
        "patch-{}-{}",
        ctx.execution_id.as_deref().unwrap_or("adhoc"),
        Utc::now().timestamp_millis()
    );
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@-_".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    if name.len() > MAX_SESSION_NAME_LEN {
        // 保留尾部的时间戳
        name = name[name.len() - MAX_SESSION_NAME_LEN..].to_string();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::{RoleSetup, SimulatedCloud};
    use crate::error::AppError;

    fn dispatch_config() -> DispatchConfig {
        DispatchConfig {
            document_name: "AWS-RunPatchBaseline".into(),
            max_concurrency: "10%".into(),
            max_errors: "1".into(),
            role_name: "PatchExecRole".into(),
            external_id: None,
            session_duration_secs: 3600,
        }
    }

    #[test]
    fn test_session_name_shape() {
        let ctx = CorrelationContext::for_execution("arn:aws:states:exec/with spaces");
        let name = session_name(&ctx);
        assert!(name.len() <= MAX_SESSION_NAME_LEN);
        assert!(!name.contains(' '));
        assert!(!name.contains(':'));
    }

    #[tokio::test]
    async fn test_throttle_is_retried() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.throttle_assume("123456789012", 2);
        let broker = CredentialBroker::new(cloud.clone(), RetryPolicy::immediate(3), &dispatch_config());
        let ctx = CorrelationContext::new();

        let account = AccountId::parse("123456789012").unwrap();
        let creds = broker.assume_for_account(&ctx, &account, None).await.unwrap();
        assert_eq!(creds.account_id, account);
        assert!(!creds.is_expired());
        assert_eq!(cloud.assume_calls(), 3);
    }

    #[tokio::test]
    async fn test_access_denied_not_retried() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.set_role("123456789012", RoleSetup::Untrusted);
        let broker = CredentialBroker::new(cloud.clone(), RetryPolicy::immediate(3), &dispatch_config());
        let ctx = CorrelationContext::new();

        let account = AccountId::parse("123456789012").unwrap();
        let err = broker.assume_for_account(&ctx, &account, None).await.unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(_)));
        assert_eq!(cloud.assume_calls(), 1);
    }

    #[tokio::test]
    async fn test_session_reassumes_near_expiry() {
        let cloud = Arc::new(SimulatedCloud::new());
        let config = DispatchConfig {
            session_duration_secs: 60,
            ..dispatch_config()
        };
        let broker = CredentialBroker::new(cloud.clone(), RetryPolicy::immediate(1), &config);
        let ctx = CorrelationContext::new();
        let account = AccountId::parse("123456789012").unwrap();

        let mut session = broker.open_session(&ctx, &account, None).await.unwrap();
        let first = session.credentials().access_key_id.clone();
        let refreshed = session.fresh(&ctx).await.unwrap().access_key_id.clone();

        assert_ne!(first, refreshed);
        assert_eq!(cloud.assume_calls(), 2);
    }

    #[tokio::test]
    async fn test_session_keeps_long_lived_credentials() {
        let cloud = Arc::new(SimulatedCloud::new());
        let broker = CredentialBroker::new(cloud.clone(), RetryPolicy::immediate(1), &dispatch_config());
        let ctx = CorrelationContext::new();
        let account = AccountId::parse("123456789012").unwrap();

        let mut session = broker.open_session(&ctx, &account, None).await.unwrap();
        session.fresh(&ctx).await.unwrap();
        session.fresh(&ctx).await.unwrap();

        assert_eq!(cloud.assume_calls(), 1);
    }

    #[tokio::test]
    async fn test_external_id_passed_through() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.set_role(
            "123456789012",
            RoleSetup::Trusted {
                external_id: Some("ext-1".into()),
            },
        );
        let broker = CredentialBroker::new(cloud.clone(), RetryPolicy::immediate(1), &dispatch_config());
        let ctx = CorrelationContext::new();
        let account = AccountId::parse("123456789012").unwrap();

        assert!(broker.assume_for_account(&ctx, &account, Some("ext-1")).await.is_ok());
        assert!(matches!(
            broker.assume_for_account(&ctx, &account, None).await,
            Err(AppError::AccessDenied(_))
        ));
    }
}
