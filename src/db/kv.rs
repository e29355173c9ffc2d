//! # 키-값 슬롯 저장소
//!
//! `kv_slots` 테이블에 대한 최소한의 연산을 제공합니다.
//! 하나의 키(key)는 하나의 JSON 문서를 담습니다 (예: `meetup_users` → 사용자 목록 JSON).
//!
//! ## 쓰기 규칙
//! - 여러 슬롯을 한 번에 쓰는 `put_many`는 하나의 트랜잭션으로 실행됩니다.
//!   중간에 실패하면 어느 슬롯도 바뀌지 않습니다.
//! - `quota_bytes`가 설정되어 있으면, 쓰기 후 전체 크기가 한도를 넘는 경우 거부합니다.
//! - 실패한 쓰기는 정확히 한 번 재시도하고, 그래도 실패하면 `StorageUnavailable`을 반환합니다.

use crate::error::AppError;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct KvStore {
    pool: SqlitePool,
    quota_bytes: Option<usize>,
}

impl KvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            quota_bytes: None,
        }
    }

    /// 저장 용량 한도(바이트)를 설정합니다. 모든 슬롯 값의 합계 기준입니다.
    pub fn with_quota(mut self, quota_bytes: Option<usize>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_slots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.put_many(&[(key, value)]).await
    }

    /// 여러 슬롯을 하나의 트랜잭션으로 씁니다. 실패 시 한 번 재시도합니다.
    pub async fn put_many(&self, entries: &[(&str, &str)]) -> Result<(), AppError> {
        match self.try_put_many(entries).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(error = %first, slots = entries.len(), "Storage write failed, retrying once");
                self.try_put_many(entries).await.map_err(|e| match e {
                    AppError::StorageUnavailable(msg) => AppError::StorageUnavailable(msg),
                    other => AppError::StorageUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn try_put_many(&self, entries: &[(&str, &str)]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        if let Some(quota) = self.quota_bytes {
            let total: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_slots",
            )
            .fetch_one(&mut *tx)
            .await?;

            let mut projected = total;
            for (key, value) in entries {
                let existing: Option<i64> = sqlx::query_scalar(
                    "SELECT LENGTH(CAST(value AS BLOB)) FROM kv_slots WHERE key = ?",
                )
                .bind(*key)
                .fetch_optional(&mut *tx)
                .await?;
                projected += value.len() as i64 - existing.unwrap_or(0);
            }

            if projected > quota as i64 {
                // tx는 drop될 때 롤백됩니다
                return Err(AppError::StorageUnavailable(format!(
                    "quota of {} bytes exceeded ({} bytes needed)",
                    quota, projected
                )));
            }
        }

        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_slots (key, value, updated_at)
                VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                ON CONFLICT(key) DO UPDATE
                SET value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(*key)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// 슬롯들을 삭제합니다. 하나라도 존재했으면 `true`.
    pub async fn remove(&self, keys: &[&str]) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for key in keys {
            removed += sqlx::query("DELETE FROM kv_slots WHERE key = ?")
                .bind(*key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed > 0)
    }

    pub async fn contains(&self, key: &str) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM kv_slots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    /// 현재 저장된 모든 슬롯 값의 총 바이트 수
    pub async fn usage_bytes(&self) -> Result<u64, AppError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_slots",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn test_put_and_get() {
        let kv = KvStore::new(connect_in_memory().await.unwrap());

        assert_eq!(kv.get("meetup_users").await.unwrap(), None);
        kv.put("meetup_users", "[]").await.unwrap();
        kv.put("meetup_users", r#"[{"id":"u1"}]"#).await.unwrap();

        assert_eq!(
            kv.get("meetup_users").await.unwrap().as_deref(),
            Some(r#"[{"id":"u1"}]"#)
        );
        assert!(kv.contains("meetup_users").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_breach_is_storage_unavailable_and_keeps_old_value() {
        let kv = KvStore::new(connect_in_memory().await.unwrap()).with_quota(Some(16));

        kv.put("a", "0123456789").await.unwrap();
        let err = kv.put_many(&[("a", "x"), ("b", "01234567890123456789")]).await.unwrap_err();

        assert!(matches!(err, AppError::StorageUnavailable(_)));
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("0123456789"));
        assert_eq!(kv.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_counts_only_the_difference_against_quota() {
        let kv = KvStore::new(connect_in_memory().await.unwrap()).with_quota(Some(12));

        kv.put("a", "0123456789").await.unwrap();
        kv.put("a", "012345678901").await.unwrap();
        assert_eq!(kv.usage_bytes().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_remove() {
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        kv.put("a", "1").await.unwrap();

        assert!(kv.remove(&["a", "missing"]).await.unwrap());
        assert!(!kv.remove(&["a"]).await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }
}
