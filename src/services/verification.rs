//! # 일회용 코드(OTP) 발급과 확인
//!
//! 6자리 코드를 만들어 `Courier`로 보내고, 저장소에는 `sha256("{user_id}:{code}")`만 남깁니다.
//! 코드는 10분 동안 유효하며, 5번 틀리면 더 이상 확인할 수 없습니다.

use crate::clock::SharedClock;
use crate::db::collection::{keep_last, Collection, StoreOptions};
use crate::db::kv::KvStore;
use crate::error::AppError;
use crate::models::verification::{CodePurpose, VerificationCode};
use crate::services::telegram::Courier;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const CODES_KEY: &str = "meetup_verification_codes";
pub const CODE_TTL_MINUTES: i64 = 10;
pub const MAX_ATTEMPTS: u64 = 5;
pub const MAX_STORED_CODES: usize = 100;

/// 발급 결과. 코드 자체는 포함하지 않습니다.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCode {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct VerificationService {
    codes: Collection<Vec<VerificationCode>>,
    courier: Courier,
    clock: SharedClock,
}

impl VerificationService {
    pub fn new(kv: KvStore, options: StoreOptions, courier: Courier, clock: SharedClock) -> Self {
        Self {
            codes: Collection::new(kv, CODES_KEY, options),
            courier,
            clock,
        }
    }

    pub fn courier(&self) -> &Courier {
        &self.courier
    }

    /// 코드를 발급하고 전송합니다. 전송에 실패하면 저장된 기록도 지웁니다.
    pub async fn issue(&self, user_id: &str, purpose: CodePurpose, chat_id: i64) -> Result<IssuedCode, AppError> {
        let now = self.clock.now_utc();
        let code = generate_code();
        let record = VerificationCode {
            id: format!("otp_{}", uuid::Uuid::now_v7()),
            user_id: user_id.to_string(),
            purpose,
            code_hash: hash_code(user_id, &code),
            created_at: now,
            expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            attempts: 0,
            consumed: false,
        };
        let issued = IssuedCode {
            id: record.id.clone(),
            expires_at: record.expires_at,
        };

        self.codes
            .mutate(|codes| {
                codes.retain(|c| c.is_live(now));
                codes.push(record);
                keep_last(codes, MAX_STORED_CODES);
                Ok(())
            })
            .await?;

        if let Err(e) = self.courier.send_code(chat_id, purpose, &code).await {
            tracing::warn!(user_id, error = %e, "Code delivery failed, discarding the code");
            self.codes
                .mutate(|codes| {
                    codes.retain(|c| c.id != issued.id);
                    Ok(())
                })
                .await?;
            return Err(e);
        }

        tracing::info!(user_id, ?purpose, "Verification code issued");
        Ok(issued)
    }

    /// 가장 최근의 사용되지 않은 코드와 비교합니다.
    /// 틀리면 시도 횟수를 저장한 뒤 `Unauthorized`, 맞으면 코드를 소비합니다.
    pub async fn verify(&self, user_id: &str, purpose: CodePurpose, code: &str) -> Result<(), AppError> {
        let now = self.clock.now_utc();
        let candidate = hash_code(user_id, code.trim());

        let accepted = self
            .codes
            .mutate(|codes| {
                let record = codes
                    .iter_mut()
                    .rev()
                    .find(|c| c.user_id == user_id && c.purpose == purpose && !c.consumed)
                    .ok_or_else(|| AppError::NotFound("Verification code".to_string()))?;

                if record.expires_at <= now {
                    return Err(AppError::InvalidInput("The code has expired".to_string()));
                }
                if record.attempts >= MAX_ATTEMPTS {
                    return Err(AppError::InvalidInput(
                        "Too many attempts, request a new code".to_string(),
                    ));
                }

                if record.code_hash == candidate {
                    record.consumed = true;
                    Ok(true)
                } else {
                    record.attempts += 1;
                    Ok(false)
                }
            })
            .await?;

        if accepted {
            tracing::info!(user_id, ?purpose, "Verification code accepted");
            Ok(())
        } else {
            Err(AppError::Unauthorized("Wrong verification code".to_string()))
        }
    }

    /// 사용자의 모든 코드를 지웁니다. 지운 개수를 반환합니다.
    pub async fn revoke_all(&self, user_id: &str) -> Result<usize, AppError> {
        self.codes
            .mutate(|codes| {
                let before = codes.len();
                codes.retain(|c| c.user_id != user_id);
                Ok(before - codes.len())
            })
            .await
    }

    pub async fn pending_for(&self, user_id: &str) -> Result<Vec<VerificationCode>, AppError> {
        let now = self.clock.now_utc();
        Ok(self
            .codes
            .load()
            .await?
            .into_iter()
            .filter(|c| c.user_id == user_id && c.is_live(now))
            .collect())
    }

    pub fn clear_cache(&self) {
        self.codes.clear_cache();
    }
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

fn hash_code(user_id: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", user_id, code).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 데모 outbox 메시지에서 코드를 꺼냅니다 (테스트용)
#[cfg(test)]
pub(crate) fn code_from_message(text: &str) -> Option<String> {
    let start = text.find("<code><b>")? + "<code><b>".len();
    text.get(start..start + 6).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::connect_in_memory;
    use std::sync::Arc;

    async fn service() -> (VerificationService, ManualClock) {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00+03:00").unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        let service = VerificationService::new(kv, StoreOptions::default(), Courier::demo("meetup_bot"), Arc::new(clock.clone()));
        (service, clock)
    }

    fn last_code(service: &VerificationService) -> String {
        let outbox = service.courier().outbox();
        code_from_message(&outbox.last().unwrap().text).unwrap()
    }

    #[tokio::test]
    async fn test_right_code_is_consumed_exactly_once() {
        let (service, _) = service().await;
        service.issue("u1", CodePurpose::Verification, 99).await.unwrap();
        let code = last_code(&service);

        service.verify("u1", CodePurpose::Verification, &code).await.unwrap();
        let again = service.verify("u1", CodePurpose::Verification, &code).await;
        assert!(matches!(again, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mismatch_increments_attempts_until_locked() {
        let (service, _) = service().await;
        service.issue("u1", CodePurpose::PasswordReset, 99).await.unwrap();
        let code = last_code(&service);
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..MAX_ATTEMPTS {
            let err = service.verify("u1", CodePurpose::PasswordReset, wrong).await.unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)));
        }

        service.clear_cache();
        assert_eq!(service.pending_for("u1").await.unwrap()[0].attempts, MAX_ATTEMPTS);
        let locked = service.verify("u1", CodePurpose::PasswordReset, &code).await;
        assert!(matches!(locked, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let (service, clock) = service().await;
        service.issue("u1", CodePurpose::Verification, 99).await.unwrap();
        let code = last_code(&service);

        clock.advance(Duration::minutes(CODE_TTL_MINUTES + 1));
        let err = service.verify("u1", CodePurpose::Verification, &code).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_purposes_do_not_mix() {
        let (service, _) = service().await;
        service.issue("u1", CodePurpose::Verification, 99).await.unwrap();
        let code = last_code(&service);

        let err = service.verify("u1", CodePurpose::PasswordReset, &code).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let (service, _) = service().await;
        service.issue("u1", CodePurpose::Verification, 1).await.unwrap();
        service.issue("u1", CodePurpose::PasswordReset, 1).await.unwrap();
        service.issue("u2", CodePurpose::Verification, 2).await.unwrap();

        assert_eq!(service.revoke_all("u1").await.unwrap(), 2);
        assert!(service.pending_for("u1").await.unwrap().is_empty());
        assert_eq!(service.pending_for("u2").await.unwrap().len(), 1);
    }

    #[test]
    fn test_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
