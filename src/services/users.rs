//! # 사용자 디렉터리
//!
//! 사용자 목록(`meetup_users`), 친구 요청(`meetup_friend_requests`),
//! 현재 세션(`meetup_current_user`) 세 컬렉션을 다룹니다.
//!
//! ## 규칙
//! - 생성: email/nickname은 대소문자와 앞뒤 공백을 무시하고 유일해야 합니다 (`Conflict`)
//! - 수정: `UserPatch`에 있는 필드만 바뀝니다. nickname을 바꾸면 유일성을 다시 검사합니다.
//! - 삭제: 그 사용자를 가리키는 친구 요청, `referredBy`, 현재 세션을 함께 정리합니다.
//!
//! 비밀번호는 Argon2id 해시로만 저장합니다.

use crate::clock::SharedClock;
use crate::db::collection::{Collection, Document, StoreOptions};
use crate::db::kv::KvStore;
use crate::error::AppError;
use crate::models::friend::*;
use crate::models::user::*;
use crate::services::geo::haversine_km;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

pub const USERS_KEY: &str = "meetup_users";
pub const FRIEND_REQUESTS_KEY: &str = "meetup_friend_requests";
pub const CURRENT_USER_KEY: &str = "meetup_current_user";
pub const REFERRAL_TTL_DAYS: i64 = 30;

const BAD_CREDENTIALS: &str = "Invalid login or password";

/// 근처 사용자 검색 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyUser {
    pub user: UserProfile,
    pub distance_km: f64,
}

#[derive(Clone)]
pub struct UserDirectory {
    users: Collection<Vec<User>>,
    requests: Collection<Vec<FriendRequest>>,
    session: Collection<Option<CurrentSession>>,
    clock: SharedClock,
}

impl UserDirectory {
    pub fn new(kv: KvStore, options: StoreOptions, clock: SharedClock) -> Self {
        Self {
            users: Collection::new(kv.clone(), USERS_KEY, options),
            requests: Collection::new(kv.clone(), FRIEND_REQUESTS_KEY, options),
            session: Collection::new(kv, CURRENT_USER_KEY, options),
            clock,
        }
    }

    pub async fn list_users(&self) -> Result<Vec<User>, AppError> {
        self.users.load().await
    }

    pub async fn get_user(&self, id: &str) -> Result<User, AppError> {
        self.users
            .load()
            .await?
            .into_iter()
            .find(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound(format!("User {}", id)))
    }

    pub async fn create_user(&self, input: NewUser) -> Result<User, AppError> {
        // Validate input
        input.validate()?;

        // Hash password with Argon2id
        let password_hash = hash_password(&input.password)?;

        let now = self.clock.now_utc();
        let user = User {
            id: format!("user_{}", uuid::Uuid::now_v7()),
            email: normalize_email(&input.email),
            nickname: input.nickname.trim().to_string(),
            password_hash,
            avatar: input.avatar,
            about: input.about.unwrap_or_default(),
            status: Presence::Online,
            registered_at: now,
            last_seen: now,
            last_active: now.timestamp_millis(),
            metadata: UserMetadata {
                version: SCHEMA_VERSION,
                created: now,
                modified: now,
            },
            referral_code: Some(generate_referral_code(now.timestamp_millis())),
            referral_generated_at: Some(now),
            telegram_chat_id: input.telegram_chat_id,
            ..User::default()
        }
        .normalized();

        let created = self
            .users
            .mutate(|users| {
                // Check if email or nickname already exists
                if email_taken(users, &user.email, None) {
                    return Err(AppError::conflict("email", "Email is already in use"));
                }
                if nickname_taken(users, &user.nickname, None) {
                    return Err(AppError::conflict("nickname", "Nickname is already taken"));
                }
                users.push(user.clone());
                Ok(user)
            })
            .await?;

        tracing::info!(user_id = %created.id, "User created");
        Ok(created)
    }

    /// 허용된 필드만 바꿉니다. `metadata.modified`가 갱신됩니다.
    pub async fn update_user(&self, id: &str, patch: UserPatch) -> Result<User, AppError> {
        let password_hash = match &patch.password {
            Some(password) if password.chars().count() < 8 => {
                return Err(AppError::InvalidInput(
                    "Password must be at least 8 characters".to_string(),
                ));
            }
            Some(password) => Some(hash_password(password)?),
            None => None,
        };
        let now = self.clock.now_utc();

        self.users
            .mutate(|users| {
                if let Some(nickname) = &patch.nickname {
                    let nickname = nickname.trim();
                    if nickname.is_empty() {
                        return Err(AppError::InvalidInput("Nickname must not be empty".to_string()));
                    }
                    if nickname_taken(users, nickname, Some(id)) {
                        return Err(AppError::conflict("nickname", "Nickname is already taken"));
                    }
                }
                if let Some(position) = patch.position {
                    check_position(position)?;
                }

                let user = users
                    .iter_mut()
                    .find(|u| u.id == id)
                    .ok_or_else(|| AppError::NotFound(format!("User {}", id)))?;
                apply_patch(user, patch, password_hash);
                user.metadata.modified = now;
                Ok(user.clone().normalized())
            })
            .await
    }

    /// JSON 객체로 수정합니다. 허용 목록 밖의 필드는 무시됩니다.
    pub async fn update_user_from_json(&self, id: &str, patch: serde_json::Value) -> Result<User, AppError> {
        self.update_user(id, UserPatch::from_json(patch)?).await
    }

    /// 사용자와 그에 딸린 친구 요청, 추천인 표시, 현재 세션을 지웁니다.
    /// 사용자가 없으면 아무것도 바꾸지 않고 `false`.
    pub async fn delete_user(&self, id: &str) -> Result<bool, AppError> {
        // 친구 수를 고치려면 지우기 전의 요청 목록이 필요합니다
        let removed_requests = {
            let requests = self.requests.load().await?;
            requests.into_iter().filter(|r| r.involves(id)).collect::<Vec<_>>()
        };

        let removed = self
            .users
            .mutate(|users| {
                let before = users.len();
                users.retain(|u| u.id != id);
                if users.len() == before {
                    return Ok(false);
                }

                for user in users.iter_mut() {
                    if user.referred_by.as_deref() == Some(id) {
                        user.referred_by = None;
                    }
                    // 친구였던 사용자의 친구 수를 줄입니다
                    let was_friend = removed_requests
                        .iter()
                        .any(|r| r.status == RequestStatus::Accepted && r.connects(id, &user.id));
                    if was_friend {
                        user.stats.friends_count = user.stats.friends_count.saturating_sub(1);
                    }
                }
                Ok(true)
            })
            .await?;

        if !removed {
            return Ok(false);
        }

        if !removed_requests.is_empty() {
            self.requests
                .mutate(|requests| {
                    requests.retain(|r| !r.involves(id));
                    Ok(())
                })
                .await?;
        }

        if self.session.load().await?.is_some_and(|s| s.user_id == id) {
            self.session.save(None).await?;
        }

        tracing::info!(user_id = %id, requests = removed_requests.len(), "User deleted");
        Ok(true)
    }

    /// email, nickname, id 중 하나로 찾습니다 (대소문자 무시).
    pub async fn find_user(&self, identifier: &str) -> Result<Option<User>, AppError> {
        Ok(self
            .users
            .load()
            .await?
            .into_iter()
            .find(|u| u.matches_identifier(identifier)))
    }

    pub async fn is_email_used(&self, email: &str, exclude_id: Option<&str>) -> Result<bool, AppError> {
        Ok(email_taken(&self.users.load().await?, email, exclude_id))
    }

    pub async fn is_nickname_used(&self, nickname: &str, exclude_id: Option<&str>) -> Result<bool, AppError> {
        Ok(nickname_taken(&self.users.load().await?, nickname, exclude_id))
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<User, AppError> {
        let user = self
            .find_user(identifier)
            .await?
            .ok_or_else(|| AppError::Unauthorized(BAD_CREDENTIALS.to_string()))?;

        // Verify password
        if !verify_password(password, &user.password_hash) {
            tracing::debug!(user_id = %user.id, "Password mismatch");
            return Err(AppError::Unauthorized(BAD_CREDENTIALS.to_string()));
        }
        if !user.is_active {
            return Err(AppError::Unauthorized("This account is deactivated".to_string()));
        }

        let now = self.clock.now_utc();
        let user = self
            .update_user(
                &user.id,
                UserPatch {
                    status: Some(Presence::Online),
                    last_seen: Some(now),
                    last_active: Some(now.timestamp_millis()),
                    ..UserPatch::default()
                },
            )
            .await?;

        self.session
            .save(Some(CurrentSession {
                user_id: user.id.clone(),
                since: now,
            }))
            .await?;

        tracing::info!(user_id = %user.id, "User logged in");
        Ok(user)
    }

    /// 현재 사용자를 오프라인으로 만들고 세션을 지웁니다. 로그인한 사용자가 없었으면 `false`.
    pub async fn logout(&self) -> Result<bool, AppError> {
        let Some(session) = self.session.load().await? else {
            return Ok(false);
        };

        let patch = UserPatch {
            status: Some(Presence::Offline),
            last_seen: Some(self.clock.now_utc()),
            ..UserPatch::default()
        };
        match self.update_user(&session.user_id, patch).await {
            Ok(_) | Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.session.save(None).await?;
        tracing::info!(user_id = %session.user_id, "User logged out");
        Ok(true)
    }

    pub async fn current_user(&self) -> Result<Option<User>, AppError> {
        let Some(session) = self.session.load().await? else {
            return Ok(None);
        };
        Ok(self
            .users
            .load()
            .await?
            .into_iter()
            .find(|u| u.id == session.user_id))
    }

    /// 본인 인증 완료 표시 (허용 목록 밖의 필드라 별도 연산입니다)
    pub async fn mark_verified(&self, id: &str) -> Result<User, AppError> {
        let now = self.clock.now_utc();
        self.users
            .mutate(|users| {
                let user = users
                    .iter_mut()
                    .find(|u| u.id == id)
                    .ok_or_else(|| AppError::NotFound(format!("User {}", id)))?;
                user.is_verified = true;
                user.metadata.modified = now;
                Ok(user.clone())
            })
            .await
    }

    // ============ 친구 요청 ============

    pub async fn send_friend_request(&self, from: &str, to: &str) -> Result<FriendRequest, AppError> {
        self.send_request(from, to, false).await
    }

    /// QR 코드로 보낸 친구 요청. 양쪽의 QR 초대 통계가 올라갑니다.
    pub async fn send_friend_request_via_qr(&self, from: &str, to: &str) -> Result<FriendRequest, AppError> {
        self.send_request(from, to, true).await
    }

    async fn send_request(&self, from: &str, to: &str, via_qr: bool) -> Result<FriendRequest, AppError> {
        if from == to {
            return Err(AppError::InvalidInput("You cannot add yourself as a friend".to_string()));
        }
        let users = self.users.load().await?;
        for id in [from, to] {
            if !users.iter().any(|u| u.id == id) {
                return Err(AppError::NotFound(format!("User {}", id)));
            }
        }

        let request = FriendRequest {
            id: format!("req_{}", uuid::Uuid::now_v7()),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            timestamp: self.clock.now_millis(),
            status: RequestStatus::Pending,
            responded_at: None,
            metadata: RequestMetadata { via_qr },
        };

        let request = self
            .requests
            .mutate(|requests| {
                // 방향과 상관없이 두 사람 사이에는 요청이 하나뿐입니다. 거절된 요청도 다시 보낼 수 없습니다.
                if let Some(existing) = requests.iter().find(|r| r.connects(from, to)) {
                    let message = match existing.status {
                        RequestStatus::Pending => "Friend request already sent",
                        RequestStatus::Accepted => "You are already friends",
                        RequestStatus::Rejected => "Friend request was rejected earlier",
                    };
                    return Err(AppError::conflict("friend_request", message));
                }
                requests.push(request.clone());
                Ok(request)
            })
            .await?;

        self.users
            .mutate(|users| {
                for user in users.iter_mut() {
                    if user.id == from {
                        user.stats.sent_requests += 1;
                        if via_qr {
                            user.stats.qr_invitations += 1;
                        }
                    } else if user.id == to && via_qr {
                        user.stats.qr_invitations_received += 1;
                    }
                }
                Ok(())
            })
            .await?;

        tracing::debug!(from, to, via_qr, "Friend request sent");
        Ok(request)
    }

    /// 받은 사람만 응답할 수 있고, 대기 중인 요청만 응답할 수 있습니다.
    pub async fn respond_to_friend_request(
        &self,
        request_id: &str,
        responder: &str,
        accept: bool,
    ) -> Result<FriendRequest, AppError> {
        let now = self.clock.now_millis();
        let request = self
            .requests
            .mutate(|requests| {
                let request = requests
                    .iter_mut()
                    .find(|r| r.id == request_id)
                    .ok_or_else(|| AppError::NotFound(format!("Friend request {}", request_id)))?;

                if request.to_user_id != responder {
                    return Err(AppError::Unauthorized(
                        "Only the recipient can answer this request".to_string(),
                    ));
                }
                if request.status != RequestStatus::Pending {
                    return Err(AppError::conflict("friend_request", "Friend request was already answered"));
                }

                request.status = if accept {
                    RequestStatus::Accepted
                } else {
                    RequestStatus::Rejected
                };
                request.responded_at = Some(now);
                Ok(request.clone())
            })
            .await?;

        if accept {
            self.users
                .mutate(|users| {
                    for user in users.iter_mut().filter(|u| request.involves(&u.id)) {
                        user.stats.friends_count += 1;
                        user.stats.total_friends += 1;
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(request)
    }

    pub async fn friends_of(&self, user_id: &str) -> Result<Vec<User>, AppError> {
        let friend_ids: Vec<String> = self
            .requests
            .load()
            .await?
            .iter()
            .filter(|r| r.status == RequestStatus::Accepted)
            .filter_map(|r| r.other_party(user_id).map(str::to_string))
            .collect();

        Ok(self
            .users
            .load()
            .await?
            .into_iter()
            .filter(|u| friend_ids.contains(&u.id))
            .collect())
    }

    pub async fn pending_requests_for(&self, user_id: &str) -> Result<Vec<FriendRequest>, AppError> {
        Ok(self
            .requests
            .load()
            .await?
            .into_iter()
            .filter(|r| r.to_user_id == user_id && r.status == RequestStatus::Pending)
            .collect())
    }

    // ============ 추천(referral) ============

    /// 추천 코드. 없으면 새로 만들어 저장합니다.
    pub async fn referral_code(&self, user_id: &str) -> Result<String, AppError> {
        let now = self.clock.now_utc();
        self.users
            .mutate(|users| {
                let user = users
                    .iter_mut()
                    .find(|u| u.id == user_id)
                    .ok_or_else(|| AppError::NotFound(format!("User {}", user_id)))?;
                if let Some(code) = &user.referral_code {
                    return Ok(code.clone());
                }
                let code = generate_referral_code(now.timestamp_millis());
                user.referral_code = Some(code.clone());
                user.referral_generated_at = Some(now);
                user.metadata.modified = now;
                Ok(code)
            })
            .await
    }

    /// 추천 코드를 사용합니다. 추천한 사용자를 반환합니다.
    pub async fn use_referral_code(&self, code: &str, new_user_id: &str) -> Result<UserProfile, AppError> {
        let code = code.trim().to_uppercase();
        let now = self.clock.now_utc();

        let referrer = self
            .users
            .mutate(|users| {
                let referrer = users
                    .iter()
                    .find(|u| u.referral_code.as_deref() == Some(code.as_str()))
                    .cloned()
                    .ok_or_else(|| AppError::InvalidInput("Unknown referral code".to_string()))?;

                // 만료는 코드를 만든 시각 기준. 만든 시각이 없는 예전 코드는 만료되지 않습니다.
                if referrer
                    .referral_generated_at
                    .is_some_and(|at| at < now - Duration::days(REFERRAL_TTL_DAYS))
                {
                    return Err(AppError::InvalidInput("This referral link has expired".to_string()));
                }
                if referrer.id == new_user_id {
                    return Err(AppError::InvalidInput("You cannot use your own referral code".to_string()));
                }
                if !users.iter().any(|u| u.id == new_user_id) {
                    return Err(AppError::NotFound(format!("User {}", new_user_id)));
                }

                for user in users.iter_mut() {
                    if user.id == referrer.id {
                        user.stats.referrals_count += 1;
                        user.stats.referral_bonus += 1;
                    } else if user.id == new_user_id {
                        user.referred_by = Some(referrer.id.clone());
                        user.metadata.modified = now;
                    }
                }
                Ok(referrer)
            })
            .await?;

        // 친구 요청은 실패해도 추천 자체는 유지됩니다
        if let Err(e) = self.send_friend_request(&referrer.id, new_user_id).await {
            tracing::debug!(error = %e, "Automatic referral friend request skipped");
        }

        tracing::info!(referrer = %referrer.id, new_user = %new_user_id, "Referral code used");
        Ok(referrer.into())
    }

    // ============ 위치 ============

    pub async fn update_position(&self, user_id: &str, position: [f64; 2]) -> Result<User, AppError> {
        check_position(position)?;
        let now = self.clock.now_utc();
        self.update_user(
            user_id,
            UserPatch {
                position: Some(position),
                last_seen: Some(now),
                last_active: Some(now.timestamp_millis()),
                ..UserPatch::default()
            },
        )
        .await
    }

    /// 반경 안의 사용자를 가까운 순으로. 숨김 상태이거나 지도 표시를 끈 사용자는 제외합니다.
    pub async fn nearby_users(
        &self,
        position: [f64; 2],
        radius_km: f64,
        exclude_id: Option<&str>,
    ) -> Result<Vec<NearbyUser>, AppError> {
        check_position(position)?;

        let mut nearby: Vec<NearbyUser> = self
            .users
            .load()
            .await?
            .into_iter()
            .filter(|u| Some(u.id.as_str()) != exclude_id && !u.invisible && u.settings.show_on_map)
            .filter_map(|u| {
                let distance_km = haversine_km(position, u.position);
                (distance_km <= radius_km).then(|| NearbyUser {
                    user: u.into(),
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        Ok(nearby)
    }

    pub fn clear_cache(&self) {
        self.users.clear_cache();
        self.requests.clear_cache();
        self.session.clear_cache();
    }
}

fn apply_patch(user: &mut User, patch: UserPatch, password_hash: Option<String>) {
    if let Some(nickname) = patch.nickname {
        user.nickname = nickname.trim().to_string();
    }
    if let Some(avatar) = patch.avatar {
        user.avatar = avatar;
    }
    if let Some(status) = patch.status {
        user.status = status;
    }
    if let Some(invisible) = patch.invisible {
        user.invisible = invisible;
    }
    if let Some(position) = patch.position {
        user.position = position;
    }
    if let Some(about) = patch.about {
        user.about = about;
    }
    if let Some(settings) = patch.settings {
        user.settings = settings;
    }
    if let Some(stats) = patch.stats {
        user.stats = stats;
    }
    if let Some(code) = patch.referral_code {
        user.referral_code = code;
    }
    if let Some(at) = patch.referral_generated_at {
        user.referral_generated_at = at;
    }
    if let Some(referred_by) = patch.referred_by {
        user.referred_by = referred_by;
    }
    if let Some(hash) = password_hash {
        user.password_hash = hash;
    }
    if let Some(last_seen) = patch.last_seen {
        user.last_seen = last_seen;
    }
    if let Some(last_active) = patch.last_active {
        user.last_active = last_active;
    }
    if let Some(chat_id) = patch.telegram_chat_id {
        user.telegram_chat_id = chat_id;
    }
}

fn email_taken(users: &[User], email: &str, exclude_id: Option<&str>) -> bool {
    let email = normalize_email(email);
    users
        .iter()
        .any(|u| Some(u.id.as_str()) != exclude_id && u.email == email)
}

fn nickname_taken(users: &[User], nickname: &str, exclude_id: Option<&str>) -> bool {
    let nickname = nickname.trim().to_lowercase();
    users
        .iter()
        .any(|u| Some(u.id.as_str()) != exclude_id && u.nickname.to_lowercase() == nickname)
}

fn check_position(position: [f64; 2]) -> Result<(), AppError> {
    if is_valid_position(position) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "Invalid coordinates [{}, {}]",
            position[0], position[1]
        )))
    }
}

fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
}

/// 해석할 수 없는 해시(예전 형식)는 어떤 비밀번호와도 일치하지 않습니다.
fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// `REF_<밀리초 36진수>_<6자리 영숫자>`, 모두 대문자
fn generate_referral_code(now_millis: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("REF_{}_{}", to_base36(now_millis.max(0) as u64), suffix).to_uppercase()
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
