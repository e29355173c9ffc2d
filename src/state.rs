//! # 애플리케이션 상태(AppState)
//!
//! 모든 서비스를 하나로 묶습니다. `Clone`해도 같은 저장소, 같은 캐시를 공유합니다.
//!
//! - 상태가 없는 서비스(users, chats, verification): 컬렉션 핸들의 복제본
//! - 상태가 있는 서비스(pedometer, notifications): `Arc<tokio::sync::Mutex<_>>`
//!
//! 여러 서비스에 걸친 흐름(사용자 삭제, 인증 코드, 비밀번호 재설정)도 여기에 있습니다.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::db::kv::KvStore;
use crate::error::AppError;
use crate::models::user::{User, UserPatch};
use crate::models::verification::CodePurpose;
use crate::services::chats::ChatSystem;
use crate::services::notifications::NotificationCenter;
use crate::services::pedometer::Pedometer;
use crate::services::telegram::Courier;
use crate::services::users::UserDirectory;
use crate::services::verification::{IssuedCode, VerificationService};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub kv: KvStore,
    pub users: UserDirectory,
    pub chats: ChatSystem,
    pub verification: VerificationService,
    pub pedometer: Arc<Mutex<Pedometer>>,
    pub notifications: Arc<Mutex<NotificationCenter>>,
    pub clock: SharedClock,
}

impl AppState {
    /// 저장소를 열고 모든 서비스를 준비합니다.
    /// 채팅 시스템 초기화(이전 버전 데이터 이전, 공용 채팅 생성)도 여기서 실행됩니다.
    pub async fn open(pool: SqlitePool, config: &Config, clock: SharedClock) -> Result<Self, AppError> {
        let kv = KvStore::new(pool).with_quota(config.storage_quota_bytes);
        let options = config.store;
        let courier = Courier::from_settings(
            &config.telegram_api_base,
            config.telegram_bot_token.as_deref(),
            &config.telegram_bot_username,
        )?;

        let users = UserDirectory::new(kv.clone(), options, clock.clone());
        let chats = ChatSystem::new(kv.clone(), options, clock.clone());
        let verification = VerificationService::new(kv.clone(), options, courier, clock.clone());
        let pedometer = Pedometer::open(kv.clone(), options, clock.clone(), config.pedometer).await?;
        let notifications = NotificationCenter::open(kv.clone(), options, clock.clone()).await?;

        chats.init().await?;
        tracing::info!(
            writer_mode = ?options.writer_mode,
            backups = options.backup_limit,
            demo_delivery = verification.courier().is_demo(),
            "Application state ready"
        );

        Ok(Self {
            kv,
            users,
            chats,
            verification,
            pedometer: Arc::new(Mutex::new(pedometer)),
            notifications: Arc::new(Mutex::new(notifications)),
            clock,
        })
    }

    /// 사용자를 지우고, 친구 요청/추천인/세션/채팅/인증 코드까지 정리합니다.
    /// 사용자가 없으면 `false`이고 아무것도 바뀌지 않습니다.
    pub async fn delete_user(&self, id: &str) -> Result<bool, AppError> {
        if !self.users.delete_user(id).await? {
            return Ok(false);
        }
        let chats = self.chats.remove_participant(id).await?;
        let codes = self.verification.revoke_all(id).await?;
        tracing::debug!(user_id = %id, chats, codes, "User data removed from every module");
        Ok(true)
    }

    pub async fn request_verification(&self, user_id: &str) -> Result<IssuedCode, AppError> {
        let user = self.users.get_user(user_id).await?;
        let chat_id = telegram_chat(&user)?;
        self.verification
            .issue(&user.id, CodePurpose::Verification, chat_id)
            .await
    }

    pub async fn confirm_verification(&self, user_id: &str, code: &str) -> Result<User, AppError> {
        self.verification
            .verify(user_id, CodePurpose::Verification, code)
            .await?;
        self.users.mark_verified(user_id).await
    }

    /// email, 닉네임 또는 id로 사용자를 찾아 재설정 코드를 보냅니다.
    pub async fn request_password_reset(&self, identifier: &str) -> Result<IssuedCode, AppError> {
        let user = self.user_by_identifier(identifier).await?;
        let chat_id = telegram_chat(&user)?;
        self.verification
            .issue(&user.id, CodePurpose::PasswordReset, chat_id)
            .await
    }

    pub async fn reset_password(&self, identifier: &str, code: &str, new_password: &str) -> Result<User, AppError> {
        let user = self.user_by_identifier(identifier).await?;
        // 코드를 쓰기 전에 비밀번호 길이부터 확인
        if new_password.chars().count() < 8 {
            return Err(AppError::InvalidInput(
                "Password must be at least 8 characters".to_string(),
            ));
        }
        self.verification
            .verify(&user.id, CodePurpose::PasswordReset, code)
            .await?;

        let patch = UserPatch {
            password: Some(new_password.to_string()),
            ..UserPatch::default()
        };
        let user = self.users.update_user(&user.id, patch).await?;
        tracing::info!(user_id = %user.id, "Password reset");
        Ok(user)
    }

    /// Telegram 채팅을 연결하고 환영 메시지를 보냅니다.
    pub async fn link_telegram(&self, user_id: &str, chat_id: i64) -> Result<User, AppError> {
        let patch = UserPatch {
            telegram_chat_id: Some(Some(chat_id)),
            ..UserPatch::default()
        };
        let user = self.users.update_user(user_id, patch).await?;
        self.verification
            .courier()
            .send_welcome(chat_id, &user.nickname)
            .await?;
        Ok(user)
    }

    /// 모든 서비스의 메모리 캐시를 비웁니다. 다음 읽기는 저장소에서 다시 읽습니다.
    pub async fn clear_caches(&self) {
        self.users.clear_cache();
        self.chats.clear_cache();
        self.verification.clear_cache();
        self.pedometer.lock().await.clear_cache();
        self.notifications.lock().await.clear_cache();
    }

    async fn user_by_identifier(&self, identifier: &str) -> Result<User, AppError> {
        self.users
            .find_user(identifier)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", identifier.trim())))
    }
}

fn telegram_chat(user: &User) -> Result<i64, AppError> {
    user.telegram_chat_id.ok_or_else(|| {
        AppError::InvalidInput(format!("User {} has no linked Telegram chat", user.id))
    })
}
