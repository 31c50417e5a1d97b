//! 进程内模拟云环境
//!
//! 可编排：按账号配置角色信任关系、注入限流与下发失败、
//! 按目标脚本化调用状态序列、设置补丁状态与实例清单。
//! `ScriptedAnalyst` 按顺序返回预设的分析回复。

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use secrecy::Secret;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{AssumeRoleRequest, CommandBackend, IssueAnalyst, Page, RoleAssumer, SecretSource};
use crate::error::{AppError, Result};
use crate::models::command::{CommandRequest, Invocation, InvocationStatus};
use crate::models::credentials::Credentials;
use crate::models::patch::{InstanceInfo, PatchState};
use crate::models::target::{Region, Target};

const DEFAULT_PAGE_SIZE: usize = 50;

/// 目标账号中的角色配置
#[derive(Debug, Clone)]
pub enum RoleSetup {
    Trusted { external_id: Option<String> },
    /// 信任关系缺失
    Untrusted,
    Missing,
}

/// 注入的下发失败
#[derive(Debug, Clone)]
pub enum SendFailure {
    /// 服务端拒绝，没有创建命令
    Rejected { code: String },
    /// 服务端已创建命令，但响应丢失
    CreatedButLost { code: String },
}

struct CommandEntry {
    target_key: String,
    client_token: String,
    script: Vec<Vec<Invocation>>,
    polls: usize,
}

pub struct SimulatedCloud {
    roles: DashMap<String, RoleSetup>,
    assume_throttles: DashMap<String, u32>,
    send_failures: DashMap<String, VecDeque<SendFailure>>,
    command_ids: DashMap<String, VecDeque<String>>,
    scripts: DashMap<String, Vec<Vec<Invocation>>>,
    patch_states: DashMap<String, Vec<PatchState>>,
    instances: DashMap<String, Vec<InstanceInfo>>,
    commands: DashMap<String, CommandEntry>,
    send_calls: DashMap<String, usize>,
    assume_calls: AtomicUsize,
    page_size: usize,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self {
            roles: DashMap::new(),
            assume_throttles: DashMap::new(),
            send_failures: DashMap::new(),
            command_ids: DashMap::new(),
            scripts: DashMap::new(),
            patch_states: DashMap::new(),
            instances: DashMap::new(),
            commands: DashMap::new(),
            send_calls: DashMap::new(),
            assume_calls: AtomicUsize::new(0),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    // ==================== 编排 ====================

    pub fn set_role(&self, account_id: &str, setup: RoleSetup) {
        self.roles.insert(account_id.to_string(), setup);
    }

    /// 接下来 times 次角色扮演返回限流
    pub fn throttle_assume(&self, account_id: &str, times: u32) {
        self.assume_throttles.insert(account_id.to_string(), times);
    }

    pub fn fail_next_send(&self, target: &Target, failure: SendFailure) {
        self.send_failures
            .entry(target.to_string())
            .or_default()
            .push_back(failure);
    }

    /// 为目标的下一次命令指定 ID
    pub fn assign_command_id(&self, target: &Target, command_id: &str) {
        self.command_ids
            .entry(target.to_string())
            .or_default()
            .push_back(command_id.to_string());
    }

    /// 每次轮询（首页请求）前进一个快照，停在最后一个
    pub fn script_invocations(&self, target: &Target, snapshots: Vec<Vec<(&str, InvocationStatus)>>) {
        let script = snapshots
            .into_iter()
            .map(|snapshot| {
                snapshot
                    .into_iter()
                    .map(|(instance_id, status)| Invocation {
                        instance_id: instance_id.to_string(),
                        status,
                        status_details: Some(status.as_str().to_string()),
                        requested_at: None,
                    })
                    .collect()
            })
            .collect();
        self.scripts.insert(target.to_string(), script);
    }

    pub fn set_patch_states(&self, target: &Target, states: Vec<PatchState>) {
        self.patch_states.insert(target.to_string(), states);
    }

    pub fn set_instances(&self, target: &Target, instances: Vec<InstanceInfo>) {
        self.instances.insert(target.to_string(), instances);
    }

    // ==================== 观测 ====================

    pub fn send_calls(&self, target: &Target) -> usize {
        self.send_calls.get(&target.to_string()).map(|c| *c).unwrap_or(0)
    }

    /// 目标上实际存在的命令数
    pub fn command_count(&self, target: &Target) -> usize {
        let key = target.to_string();
        self.commands.iter().filter(|c| c.target_key == key).count()
    }

    pub fn assume_calls(&self) -> usize {
        self.assume_calls.load(Ordering::SeqCst)
    }

    // ==================== 内部 ====================

    fn target_key(credentials: &Credentials, region: &Region) -> String {
        format!("{}:{}", credentials.account_id, region)
    }

    fn check_credentials(credentials: &Credentials) -> Result<()> {
        if credentials.is_expired() {
            return Err(AppError::remote("ExpiredTokenException", "security token has expired"));
        }
        Ok(())
    }

    fn default_script(&self, target_key: &str) -> Vec<Vec<Invocation>> {
        let mut ids: Vec<String> = self
            .patch_states
            .get(target_key)
            .map(|s| s.iter().map(|p| p.instance_id.clone()).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            ids.push("i-0000000000000001".to_string());
        }
        vec![ids
            .into_iter()
            .map(|instance_id| Invocation {
                instance_id,
                status: InvocationStatus::Success,
                status_details: Some("Success".to_string()),
                requested_at: Some(Utc::now()),
            })
            .collect()]
    }

    fn create_command(&self, target_key: &str, client_token: &str) -> String {
        let command_id = self
            .command_ids
            .get_mut(target_key)
            .and_then(|mut ids| ids.pop_front())
            .unwrap_or_else(|| format!("cmd-{}", Uuid::new_v4()));
        let script = self
            .scripts
            .get(target_key)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| self.default_script(target_key));

        self.commands.insert(
            command_id.clone(),
            CommandEntry {
                target_key: target_key.to_string(),
                client_token: client_token.to_string(),
                script,
                polls: 0,
            },
        );
        command_id
    }

    fn paginate<T: Clone>(&self, items: &[T], next_token: Option<String>) -> Result<Page<T>> {
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| AppError::remote("InvalidNextToken", "next token is malformed"))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let page_items = items.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
        let next_token = (end < items.len()).then(|| end.to_string());

        Ok(Page {
            items: page_items,
            next_token,
        })
    }
}

#[async_trait]
impl RoleAssumer for SimulatedCloud {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credentials> {
        self.assume_calls.fetch_add(1, Ordering::SeqCst);
        let account = request.role_arn.account_id().as_str().to_string();

        if let Some(mut remaining) = self.assume_throttles.get_mut(&account) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::Throttled("AssumeRole rate exceeded".to_string()));
            }
        }

        let setup = self
            .roles
            .get(&account)
            .map(|r| r.value().clone())
            .unwrap_or(RoleSetup::Trusted { external_id: None });

        match setup {
            RoleSetup::Missing => {
                return Err(AppError::RoleNotFound(request.role_arn.to_string()));
            }
            RoleSetup::Untrusted => {
                return Err(AppError::AccessDenied(format!(
                    "not authorized to assume {}",
                    request.role_arn
                )));
            }
            RoleSetup::Trusted { external_id } => {
                if external_id.is_some() && external_id != request.external_id {
                    return Err(AppError::AccessDenied(format!(
                        "external id mismatch for {}",
                        request.role_arn
                    )));
                }
            }
        }

        let duration = request.duration_secs.min(3600) as i64;
        Ok(Credentials {
            access_key_id: format!("ASIA{}", &Uuid::new_v4().simple().to_string()[..16].to_uppercase()),
            secret_access_key: Secret::new(Uuid::new_v4().to_string()),
            session_token: Secret::new(format!("{}:{}", request.session_name, Uuid::new_v4())),
            expiration: Utc::now() + Duration::seconds(duration),
            account_id: request.role_arn.account_id().clone(),
        })
    }
}

#[async_trait]
impl CommandBackend for SimulatedCloud {
    async fn send_command(
        &self,
        credentials: &Credentials,
        region: &Region,
        request: &CommandRequest,
    ) -> Result<String> {
        Self::check_credentials(credentials)?;
        let key = Self::target_key(credentials, region);
        *self.send_calls.entry(key.clone()).or_insert(0) += 1;

        if request.document_name.is_empty() {
            return Err(AppError::remote("InvalidDocument", "document name is empty"));
        }

        let failure = self
            .send_failures
            .get_mut(&key)
            .and_then(|mut queue| queue.pop_front());
        match failure {
            Some(SendFailure::Rejected { code }) => {
                Err(AppError::remote(&code, "send command failed"))
            }
            Some(SendFailure::CreatedButLost { code }) => {
                self.create_command(&key, &request.client_token);
                Err(AppError::remote(&code, "response lost after command creation"))
            }
            None => Ok(self.create_command(&key, &request.client_token)),
        }
    }

    async fn find_command_by_client_token(
        &self,
        credentials: &Credentials,
        region: &Region,
        client_token: &str,
    ) -> Result<Option<String>> {
        Self::check_credentials(credentials)?;
        let key = Self::target_key(credentials, region);
        Ok(self
            .commands
            .iter()
            .find(|c| c.target_key == key && c.client_token == client_token)
            .map(|c| c.key().clone()))
    }

    async fn list_command_invocations(
        &self,
        credentials: &Credentials,
        region: &Region,
        command_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<Invocation>> {
        Self::check_credentials(credentials)?;
        let key = Self::target_key(credentials, region);

        let snapshot = {
            let mut entry = self
                .commands
                .get_mut(command_id)
                .filter(|c| c.target_key == key)
                .ok_or_else(|| AppError::remote("InvalidCommandId", "command not found"))?;

            if next_token.is_none() {
                entry.polls += 1;
            }
            let last = entry.script.len().saturating_sub(1);
            let index = entry.polls.saturating_sub(1).min(last);
            entry.script.get(index).cloned().unwrap_or_default()
        };

        self.paginate(&snapshot, next_token)
    }

    async fn describe_instance_patch_states(
        &self,
        credentials: &Credentials,
        region: &Region,
        next_token: Option<String>,
    ) -> Result<Page<PatchState>> {
        Self::check_credentials(credentials)?;
        let key = Self::target_key(credentials, region);
        let states = self.patch_states.get(&key).map(|s| s.value().clone()).unwrap_or_default();
        self.paginate(&states, next_token)
    }

    async fn describe_instance_information(
        &self,
        credentials: &Credentials,
        region: &Region,
        next_token: Option<String>,
    ) -> Result<Page<InstanceInfo>> {
        Self::check_credentials(credentials)?;
        let key = Self::target_key(credentials, region);
        let instances = self.instances.get(&key).map(|s| s.value().clone()).unwrap_or_default();
        self.paginate(&instances, next_token)
    }
}

/// 固定值密钥来源，记录读取次数
pub struct StaticSecretSource {
    value: String,
    fetches: AtomicUsize,
}

impl StaticSecretSource {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    async fn fetch_secret(&self, name: &str) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(secret = name, "Secret fetched");
        Ok(self.value.clone())
    }
}

/// 未预设回复时的默认分析结论
const DEFAULT_ANALYSIS: &str =
    r#"{"recommendation":"CONTINUE_WITH_CAUTION","severity":"MEDIUM","summary":"Simulated analysis"}"#;

/// 预设回复的分析助手，记录收到的提示
#[derive(Default)]
pub struct ScriptedAnalyst {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAnalyst {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(reply.to_string()));
        }
    }

    pub fn push_failure(&self, error: AppError) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(error));
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl IssueAnalyst for ScriptedAnalyst {
    async fn analyze(&self, session_id: &str, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .map_err(|_| AppError::internal_error("analyst lock poisoned"))?
            .push(prompt.to_string());
        let next = self
            .replies
            .lock()
            .map_err(|_| AppError::internal_error("analyst lock poisoned"))?
            .pop_front();
        tracing::debug!(session_id, prompt_length = prompt.len(), "Analysis requested");
        next.unwrap_or_else(|| Ok(DEFAULT_ANALYSIS.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::target::RoleArn;

    fn request(account: &str, external_id: Option<&str>) -> AssumeRoleRequest {
        AssumeRoleRequest {
            role_arn: RoleArn::parse(&format!("arn:aws:iam::{}:role/PatchExecRole", account)).unwrap(),
            session_name: "test".into(),
            external_id: external_id.map(String::from),
            duration_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_role_setup_errors() {
        let cloud = SimulatedCloud::new();
        cloud.set_role("111111111111", RoleSetup::Missing);
        cloud.set_role("222222222222", RoleSetup::Untrusted);
        cloud.set_role(
            "333333333333",
            RoleSetup::Trusted {
                external_id: Some("ext".into()),
            },
        );

        assert!(matches!(
            cloud.assume_role(&request("111111111111", None)).await,
            Err(AppError::RoleNotFound(_))
        ));
        assert!(matches!(
            cloud.assume_role(&request("222222222222", None)).await,
            Err(AppError::AccessDenied(_))
        ));
        assert!(matches!(
            cloud.assume_role(&request("333333333333", Some("wrong"))).await,
            Err(AppError::AccessDenied(_))
        ));
        assert!(cloud.assume_role(&request("333333333333", Some("ext"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_pagination() {
        let cloud = SimulatedCloud::new().with_page_size(2);
        let items = vec![1, 2, 3, 4, 5];
        let first = cloud.paginate(&items, None).unwrap();
        assert_eq!(first.items, vec![1, 2]);
        let last = cloud.paginate(&items, Some("4".into())).unwrap();
        assert_eq!(last.items, vec![5]);
        assert!(last.next_token.is_none());
    }
}
