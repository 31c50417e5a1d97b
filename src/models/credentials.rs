//! 临时执行凭证
//!
//! 只在单个目标的处理流水线内持有，不持久化、不跨目标共享。

use chrono::{DateTime, Utc};
use secrecy::Secret;

use super::target::AccountId;

/// 凭证最长有效期（秒）
pub const MAX_SESSION_SECS: u64 = 3600;

#[derive(Debug)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub session_token: Secret<String>,
    pub expiration: DateTime<Utc>,
    /// 凭证作用的账号
    pub account_id: AccountId,
}

impl Credentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
