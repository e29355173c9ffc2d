//! # 데이터베이스 접근 계층 (Data Access Layer)
//!
//! 브라우저 localStorage를 SQLite 키-값 테이블(`kv_slots`)로 대체합니다.
//! 각 서비스(services/)는 이 모듈의 `Collection`을 통해서만 데이터를 읽고 씁니다.
//!
//! 각 하위 모듈:
//! - `kv`: 슬롯 단위 읽기/쓰기, 트랜잭션, 저장 용량(quota) 검사
//! - `collection`: 읽기 시 정규화, 쓰기 시 원자적 저장, 캐시, 백업, 쓰기 모드
//! - `lenient`: 타입이 어긋난 필드를 기본값으로 대체하는 관대한 역직렬화 헬퍼

pub mod collection;
pub mod kv;
pub mod lenient;

pub use collection::*;
pub use kv::KvStore;

use crate::error::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// 데이터베이스에 연결하고 마이그레이션을 실행합니다.
///
/// 파일이 없으면 새로 만듭니다 (`create_if_missing`).
pub async fn connect(database_url: &str) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // 최대 5개의 동시 연결을 유지
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// 메모리 DB에 연결합니다. 테스트와 일회성 실행에 사용됩니다.
///
/// `sqlite::memory:`는 연결마다 별개의 DB가 생기므로 연결을 1개로 고정하고,
/// 그 연결이 풀에서 닫히지 않도록 idle/lifetime 제한을 끕니다.
pub async fn connect_in_memory() -> Result<SqlitePool, AppError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<(), AppError> {
    tracing::debug!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))
}
