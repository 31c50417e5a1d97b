//! 目标模型：账号 + 区域

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

static REGION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").unwrap());

static ACCOUNT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{12}$").unwrap());

/// 区域标识最短长度（如 "us-east-1"）
pub const MIN_REGION_LEN: usize = 8;

/// 12 位数字账号 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if !ACCOUNT_ID_RE.is_match(value) {
            return Err(AppError::Validation(format!("Invalid account ID format: {}", value)));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 区域标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.chars().count() < MIN_REGION_LEN || !REGION_RE.is_match(value) {
            return Err(AppError::Validation(format!("Invalid region format: {}", value)));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Region {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Region> for String {
    fn from(value: Region) -> Self {
        value.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 执行目标：一个 (账号, 区域) 对
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub account_id: AccountId,
    pub region: Region,
}

impl Target {
    pub fn new(account_id: AccountId, region: Region) -> Self {
        Self { account_id, region }
    }

    pub fn parse(account_id: &str, region: &str) -> Result<Self> {
        Ok(Self::new(AccountId::parse(account_id)?, Region::parse(region)?))
    }

    /// 账号 × 区域 的笛卡尔积，保持输入顺序
    pub fn cross(accounts: &[AccountId], regions: &[Region]) -> Vec<Target> {
        accounts
            .iter()
            .flat_map(|account| {
                regions
                    .iter()
                    .map(move |region| Target::new(account.clone(), region.clone()))
            })
            .collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.region)
    }
}

/// 跨账号角色 ARN，例如 `arn:aws:iam::123456789012:role/PatchExecRole`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleArn {
    raw: String,
    account_id: AccountId,
}

impl RoleArn {
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[2] != "iam" || !parts[5].starts_with("role/")
        {
            return Err(AppError::Validation(format!("Invalid role ARN: {}", value)));
        }
        let account_id = AccountId::parse(parts[4])?;
        Ok(Self {
            raw: value.trim().to_string(),
            account_id,
        })
    }

    /// 由账号与角色名构造
    pub fn for_account(account_id: &AccountId, role_name: &str) -> Self {
        Self {
            raw: format!("arn:aws:iam::{}:role/{}", account_id, role_name),
            account_id: account_id.clone(),
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl TryFrom<String> for RoleArn {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoleArn> for String {
    fn from(value: RoleArn) -> Self {
        value.raw
    }
}

impl fmt::Display for RoleArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
