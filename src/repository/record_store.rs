//! 状态与审计记录存储
//!
//! PostgreSQL 实现用于部署环境；未配置数据库时使用内存实现。

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use std::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::audit::{record_key, AuditRecord, StateRecord, StateScope};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 写入状态快照，同键覆盖
    async fn put_state(&self, record: &StateRecord) -> Result<()>;

    async fn get_state(&self, scope: StateScope, id: &str) -> Result<Option<StateRecord>>;

    /// 追加审计记录
    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    async fn list_audit(&self, execution_id: &str) -> Result<Vec<AuditRecord>>;

    /// 标记审批令牌已处理；已存在时返回 false
    async fn mark_resolved(&self, token_hash: &str, execution_id: &str, action: &str) -> Result<bool>;
}

// ==================== PostgreSQL ====================

pub struct PgRecordStore {
    db: PgPool,
}

impl PgRecordStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn scope_from_str(value: &str) -> Result<StateScope> {
    match value {
        "PRE" => Ok(StateScope::Pre),
        "POST" => Ok(StateScope::Post),
        other => Err(AppError::Internal(format!("Unknown state scope: {}", other))),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn put_state(&self, record: &StateRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO state_records (scope, id, execution_id, payload, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scope, id) DO UPDATE
            SET execution_id = EXCLUDED.execution_id,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(record.scope.as_str())
        .bind(&record.id)
        .bind(&record.execution_id)
        .bind(&record.payload)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_state(&self, scope: StateScope, id: &str) -> Result<Option<StateRecord>> {
        let row = sqlx::query(
            r#"
            SELECT scope, id, execution_id, payload, created_at, expires_at
            FROM state_records
            WHERE scope = $1 AND id = $2 AND expires_at > NOW()
            "#,
        )
        .bind(scope.as_str())
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| -> Result<StateRecord> {
            Ok(StateRecord {
                scope: scope_from_str(row.try_get::<String, _>("scope")?.as_str())?,
                id: row.try_get("id")?,
                execution_id: row.try_get("execution_id")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, event_type, execution_id, action, subject, details,
                correlation_id, occurred_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(&record.event_type)
        .bind(&record.execution_id)
        .bind(&record.action)
        .bind(&record.subject)
        .bind(&record.details)
        .bind(&record.correlation_id)
        .bind(record.occurred_at)
        .bind(record.expires_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_audit(&self, execution_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, execution_id, action, subject, details,
                   correlation_id, occurred_at, expires_at
            FROM audit_records
            WHERE execution_id = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<AuditRecord> {
                Ok(AuditRecord {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    execution_id: row.try_get("execution_id")?,
                    action: row.try_get("action")?,
                    subject: row.try_get("subject")?,
                    details: row.try_get("details")?,
                    correlation_id: row.try_get("correlation_id")?,
                    occurred_at: row.try_get("occurred_at")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn mark_resolved(&self, token_hash: &str, execution_id: &str, action: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO resolved_approvals (token_hash, execution_id, action, resolved_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (token_hash) DO NOTHING
            "#,
        )
        .bind(token_hash)
        .bind(execution_id)
        .bind(action)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ==================== 内存 ====================

#[derive(Default)]
pub struct MemoryRecordStore {
    states: DashMap<String, StateRecord>,
    audits: Mutex<Vec<AuditRecord>>,
    resolved: DashMap<String, (String, String)>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_count(&self) -> usize {
        self.audits.lock().map(|a| a.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_state(&self, record: &StateRecord) -> Result<()> {
        self.states.insert(record.key(), record.clone());
        Ok(())
    }

    async fn get_state(&self, scope: StateScope, id: &str) -> Result<Option<StateRecord>> {
        let now = Utc::now();
        Ok(self
            .states
            .get(&record_key(scope, id))
            .map(|r| r.value().clone())
            .filter(|r| r.expires_at > now))
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.audits
            .lock()
            .map_err(|_| AppError::internal_error("audit store lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    async fn list_audit(&self, execution_id: &str) -> Result<Vec<AuditRecord>> {
        let audits = self
            .audits
            .lock()
            .map_err(|_| AppError::internal_error("audit store lock poisoned"))?;
        Ok(audits
            .iter()
            .filter(|r| r.execution_id.as_deref() == Some(execution_id))
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, token_hash: &str, execution_id: &str, action: &str) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        match self.resolved.entry(token_hash.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert((execution_id.to_string(), action.to_string()));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::target::Target;

    #[tokio::test]
    async fn test_memory_state_roundtrip_by_key() {
        let store = MemoryRecordStore::new();
        let target = Target::parse("123456789012", "us-east-1").unwrap();
        let record = StateRecord::new(
            StateScope::Pre,
            &target,
            Some("exec-1".into()),
            serde_json::json!({"instances": 3}),
            Utc::now(),
            90,
        );
        store.put_state(&record).await.unwrap();

        let loaded = store.get_state(StateScope::Pre, &record.id).await.unwrap();
        assert_eq!(loaded, Some(record.clone()));
        assert!(store.get_state(StateScope::Post, &record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_resolved_once() {
        let store = MemoryRecordStore::new();
        assert!(store.mark_resolved("abc", "exec-1", "approve").await.unwrap());
        assert!(!store.mark_resolved("abc", "exec-1", "reject").await.unwrap());
    }
}
