//! # 로컬 문서 저장소 규약 (Document Store convention)
//!
//! 사용자, 친구 요청, 채팅, 알림 설정, 만보기 통계는 모두 같은 방식으로 저장됩니다:
//!
//! ```text
//! load()   : 슬롯 읽기 → JSON 파싱(실패 시 빈 값) → 레코드별 정규화 → 캐시
//! save(x)  : 정규화 → 직렬화 → [이전 값 스냅샷 + 새 값]을 한 트랜잭션으로 쓰기 → 캐시 갱신
//! mutate(f): load → f(&mut 값) → save   (f가 에러면 아무것도 쓰지 않음)
//! ```
//!
//! ## 저장 형태(`Stored`)
//! - `Vec<T>`: 목록 (`meetup_users`, `meetup_friend_requests` ...)
//! - `BTreeMap<String, S>`: id → 값 매핑 (`meetup_chats_v2`, `meetup_chat_index`)
//! - `Option<T>`: 없을 수 있는 단일 문서 (`meetup_current_user`, `meetup_global_chat_v2`)
//! - 단일 문서: `single_document!` 매크로로 등록 (`meetup_pedometer_stats` ...)
//!
//! ## 쓰기 모드(`WriterMode`)
//! - `SingleWriter`(기본): 잠금 없음. 같은 프로세스 안에서 동시에 mutate하면 나중 쓰기가 이깁니다.
//! - `Locked`: 컬렉션마다 `tokio::sync::Mutex`로 read-modify-write 전체를 직렬화합니다.
//!   어느 모드도 프로세스 간 조율은 하지 않습니다.

use crate::db::kv::KvStore;
use crate::db::lenient;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// 컬렉션에 저장되는 레코드 하나
///
/// `normalized()`는 읽기/쓰기 때마다 호출됩니다.
/// 여러 번 호출해도 결과가 같아야 합니다 (멱등성).
pub trait Document: Serialize + DeserializeOwned + Default + Clone + Send + 'static {
    fn normalized(self) -> Self {
        self
    }
}

/// 하나의 슬롯에 통째로 저장되는 값의 형태
pub trait Stored: Serialize + Clone + Send + 'static {
    /// 파싱된 JSON에서 관대하게 값을 만듭니다. 절대 실패하지 않습니다.
    fn from_json(value: Value) -> Self;
    fn normalize(self) -> Self;
    fn empty() -> Self;
}

impl<T: Document> Stored for Vec<T> {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => items
                .into_iter()
                .filter(Value::is_object)
                .map(lenient::document)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn normalize(self) -> Self {
        self.into_iter().map(Document::normalized).collect()
    }

    fn empty() -> Self {
        Vec::new()
    }
}

impl<S: Stored> Stored for BTreeMap<String, S> {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| (k, S::from_json(v)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    fn normalize(self) -> Self {
        self.into_iter().map(|(k, v)| (k, v.normalize())).collect()
    }

    fn empty() -> Self {
        BTreeMap::new()
    }
}

impl<T: Document> Stored for Option<T> {
    fn from_json(value: Value) -> Self {
        value.is_object().then(|| lenient::document(value))
    }

    fn normalize(self) -> Self {
        self.map(Document::normalized)
    }

    fn empty() -> Self {
        None
    }
}

/// 단일 문서 타입을 `Stored`로 등록합니다. 슬롯이 비어 있으면 `Default` 값입니다.
macro_rules! single_document {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::db::collection::Stored for $ty {
                fn from_json(value: ::serde_json::Value) -> Self {
                    $crate::db::lenient::document(value)
                }

                fn normalize(self) -> Self {
                    $crate::db::collection::Document::normalized(self)
                }

                fn empty() -> Self {
                    <$ty as Default>::default()
                }
            }
        )+
    };
}
pub(crate) use single_document;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriterMode {
    #[default]
    SingleWriter,
    Locked,
}

impl FromStr for WriterMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_writer" | "single-writer" => Ok(WriterMode::SingleWriter),
            "locked" => Ok(WriterMode::Locked),
            other => Err(AppError::InvalidInput(format!(
                "Unknown writer mode '{}', expected 'single' or 'locked'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub writer_mode: WriterMode,
    /// 슬롯마다 보관할 이전 값 스냅샷 수 (0이면 보관하지 않음)
    pub backup_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            writer_mode: WriterMode::SingleWriter,
            backup_limit: 3,
        }
    }
}

/// 덮어쓰기 직전 값의 스냅샷. `<key>:backups` 슬롯에 최신 N개만 남습니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backup {
    #[serde(deserialize_with = "lenient::count")]
    pub version: u64,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub saved_at: DateTime<Utc>,
    /// 원본 JSON. 파싱할 수 없었던 값은 문자열 그대로 보관됩니다.
    pub data: Value,
}

impl Document for Backup {}

struct Inner<C> {
    kv: KvStore,
    key: String,
    backups_key: String,
    options: StoreOptions,
    cache: Mutex<Option<C>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// 하나의 슬롯에 대한 핸들. 복제본끼리 캐시와 쓰기 잠금을 공유합니다.
pub struct Collection<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Collection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Stored> Collection<C> {
    pub fn new(kv: KvStore, key: impl Into<String>, options: StoreOptions) -> Self {
        let key = key.into();
        Self {
            inner: Arc::new(Inner {
                kv,
                backups_key: format!("{}:backups", key),
                key,
                options,
                cache: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// 정규화된 값을 읽습니다. 슬롯이 없거나 깨져 있으면 빈 값입니다.
    pub async fn load(&self) -> Result<C, AppError> {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }
        let value = self.read_through().await?;
        self.set_cache(Some(value.clone()));
        Ok(value)
    }

    /// 값을 정규화해서 저장하고, 저장된 값을 돌려줍니다.
    pub async fn save(&self, value: C) -> Result<C, AppError> {
        let normalized = value.normalize();
        let json = serde_json::to_string(&normalized)
            .map_err(|e| AppError::Internal(format!("Failed to serialize {}: {}", self.key(), e)))?;

        if self.inner.options.backup_limit == 0 {
            self.inner.kv.put(self.key(), &json).await?;
        } else {
            let backups = self.next_backups().await?;
            let backups_json = serde_json::to_string(&backups)
                .map_err(|e| AppError::Internal(format!("Failed to serialize backups: {}", e)))?;
            self.inner
                .kv
                .put_many(&[
                    (self.key(), json.as_str()),
                    (self.inner.backups_key.as_str(), backups_json.as_str()),
                ])
                .await?;
        }

        tracing::debug!(key = %self.key(), bytes = json.len(), "Collection saved");
        self.set_cache(Some(normalized.clone()));
        Ok(normalized)
    }

    /// read-modify-write. 클로저가 에러를 반환하면 아무것도 쓰지 않습니다.
    pub async fn mutate<R, F>(&self, f: F) -> Result<R, AppError>
    where
        F: FnOnce(&mut C) -> Result<R, AppError>,
    {
        let _guard = match self.inner.options.writer_mode {
            WriterMode::Locked => Some(self.inner.write_lock.lock().await),
            WriterMode::SingleWriter => None,
        };

        let mut value = self.load().await?;
        let out = f(&mut value)?;
        self.save(value).await?;
        Ok(out)
    }

    /// 슬롯이 실제로 존재하는지 (마이그레이션 판단용)
    pub async fn exists(&self) -> Result<bool, AppError> {
        self.inner.kv.contains(self.key()).await
    }

    /// 보관 중인 스냅샷 (오래된 것부터)
    pub async fn backups(&self) -> Result<Vec<Backup>, AppError> {
        let raw = self.inner.kv.get(&self.inner.backups_key).await?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .map(<Vec<Backup>>::from_json)
            .unwrap_or_default())
    }

    /// 스냅샷 버전으로 되돌립니다. 되돌린 값도 일반 저장과 같이 정규화됩니다.
    pub async fn restore(&self, version: u64) -> Result<C, AppError> {
        let backup = self
            .backups()
            .await?
            .into_iter()
            .find(|b| b.version == version)
            .ok_or_else(|| AppError::NotFound(format!("Backup {} of {}", version, self.key())))?;

        let data = match backup.data {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::Null),
            other => other,
        };
        self.save(C::from_json(data)).await
    }

    /// 슬롯과 스냅샷을 모두 지웁니다.
    pub async fn clear(&self) -> Result<(), AppError> {
        self.inner
            .kv
            .remove(&[self.key(), self.inner.backups_key.as_str()])
            .await?;
        self.set_cache(None);
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.set_cache(None);
    }

    async fn read_through(&self) -> Result<C, AppError> {
        let raw = match self.inner.kv.get(self.key()).await? {
            Some(raw) => raw,
            None => return Ok(C::empty()),
        };

        let value = match serde_json::from_str::<Value>(&raw) {
            Ok(json) => C::from_json(json),
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "Corrupt slot, falling back to defaults");
                C::empty()
            }
        };
        Ok(value.normalize())
    }

    async fn next_backups(&self) -> Result<Vec<Backup>, AppError> {
        let previous = match self.inner.kv.get(self.key()).await? {
            Some(raw) => raw,
            None => return self.backups().await,
        };

        let mut backups = self.backups().await?;
        let version = backups.last().map_or(1, |b| b.version + 1);
        backups.push(Backup {
            version,
            saved_at: Utc::now(),
            data: serde_json::from_str(&previous).unwrap_or(Value::String(previous)),
        });
        keep_last(&mut backups, self.inner.options.backup_limit);
        Ok(backups)
    }

    fn cached(&self) -> Option<C> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_cache(&self, value: Option<C>) {
        *self.inner.cache.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }
}

/// 목록의 마지막(최신) `limit`개만 남깁니다.
pub fn keep_last<T>(items: &mut Vec<T>, limit: usize) {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct Counter {
        #[serde(deserialize_with = "lenient::or_default")]
        name: String,
        #[serde(deserialize_with = "lenient::count")]
        hits: u64,
    }

    impl Document for Counter {
        fn normalized(mut self) -> Self {
            self.name = self.name.trim().to_lowercase();
            self
        }
    }

    single_document!(Counter);

    async fn kv() -> KvStore {
        KvStore::new(connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_missing_slot_loads_empty() {
        let list: Collection<Vec<Counter>> = Collection::new(kv().await, "list", StoreOptions::default());
        assert!(list.load().await.unwrap().is_empty());
        assert!(!list.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_slot_falls_back_to_default() {
        let kv = kv().await;
        kv.put("counter", "{not json").await.unwrap();
        let counter: Collection<Counter> = Collection::new(kv, "counter", StoreOptions::default());

        assert_eq!(counter.load().await.unwrap(), Counter::default());
    }

    #[tokio::test]
    async fn test_load_normalizes_every_record() {
        let kv = kv().await;
        kv.put("list", r#"[{"name":"  Alice ","hits":"3"}, 17, {"hits":-1}]"#).await.unwrap();
        let list: Collection<Vec<Counter>> = Collection::new(kv, "list", StoreOptions::default());

        let loaded = list.load().await.unwrap();
        assert_eq!(
            loaded,
            vec![
                Counter { name: "alice".into(), hits: 3 },
                Counter { name: String::new(), hits: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_normalized_value() {
        let list: Collection<Vec<Counter>> = Collection::new(kv().await, "list", StoreOptions::default());
        let value = vec![Counter { name: " BOB".into(), hits: 2 }];

        let saved = list.save(value.clone()).await.unwrap();
        list.clear_cache();
        let loaded = list.load().await.unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded, value.normalize());
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let counter: Collection<Counter> = Collection::new(kv().await, "counter", StoreOptions::default());
        counter.save(Counter { name: "a".into(), hits: 1 }).await.unwrap();

        let err = counter
            .mutate(|c| {
                c.hits = 100;
                Err::<(), _>(AppError::InvalidInput("nope".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
        counter.clear_cache();
        assert_eq!(counter.load().await.unwrap().hits, 1);
    }

    #[tokio::test]
    async fn test_backups_are_bounded_and_restorable() {
        let options = StoreOptions { backup_limit: 2, ..StoreOptions::default() };
        let counter: Collection<Counter> = Collection::new(kv().await, "counter", options);

        for hits in 1..=4 {
            counter.save(Counter { name: "c".into(), hits }).await.unwrap();
        }

        let backups = counter.backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].version, 2);
        assert_eq!(backups[1].version, 3);
        assert_eq!(backups[1].data["hits"], 3);

        let restored = counter.restore(2).await.unwrap();
        assert_eq!(restored.hits, 2);
        assert!(matches!(counter.restore(1).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_locked_mode_loses_no_updates() {
        let options = StoreOptions { writer_mode: WriterMode::Locked, backup_limit: 0 };
        let counter: Collection<Counter> = Collection::new(kv().await, "counter", options);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                counter
                    .mutate(|c| {
                        c.hits += 1;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        counter.clear_cache();
        assert_eq!(counter.load().await.unwrap().hits, 20);
    }

    #[tokio::test]
    async fn test_quota_breach_surfaces_storage_unavailable() {
        let kv = kv().await.with_quota(Some(40));
        let list: Collection<Vec<Counter>> =
            Collection::new(kv, "list", StoreOptions { backup_limit: 0, ..StoreOptions::default() });

        let many = (0..10).map(|i| Counter { name: format!("n{}", i), hits: i }).collect();
        let err = list.save(many).await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
        assert!(list.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_writer_mode_parsing() {
        assert_eq!("locked".parse::<WriterMode>().unwrap(), WriterMode::Locked);
        assert_eq!(" Single ".parse::<WriterMode>().unwrap(), WriterMode::SingleWriter);
        assert!("sometimes".parse::<WriterMode>().is_err());
    }

    #[test]
    fn test_keep_last() {
        let mut items = vec![1, 2, 3, 4, 5];
        keep_last(&mut items, 2);
        assert_eq!(items, vec![4, 5]);
    }
}
