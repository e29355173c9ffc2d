use crate::db::collection::Document;
use crate::db::lenient;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_NICKNAME: &str = "User";
pub const DEFAULT_POSITION: [f64; 2] = [55.751244, 37.618423];
pub const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    #[default]
    Offline,
    Away,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Public,
    Friends,
    Private,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
    Auto,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserStats {
    #[serde(deserialize_with = "lenient::count")]
    pub friends_count: u64,
    #[serde(deserialize_with = "lenient::decimal")]
    pub total_distance: f64,
    #[serde(deserialize_with = "lenient::decimal")]
    pub online_hours: f64,
    #[serde(deserialize_with = "lenient::count")]
    pub total_friends: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub meeting_count: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub referrals_count: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub referral_bonus: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub qr_invitations: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub qr_invitations_received: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub sent_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub notifications: bool,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub show_on_map: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub privacy: Privacy,
    #[serde(deserialize_with = "lenient::or_default")]
    pub theme: Theme,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            notifications: true,
            show_on_map: true,
            privacy: Privacy::default(),
            theme: Theme::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserMetadata {
    #[serde(deserialize_with = "lenient::count")]
    pub version: u64,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub created: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub email: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub nickname: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub password_hash: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub avatar: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub about: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub status: Presence,
    #[serde(deserialize_with = "lenient::or_default")]
    pub invisible: bool,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub registered_at: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub last_seen: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::millis")]
    pub last_active: i64,
    #[serde(deserialize_with = "position")]
    pub position: [f64; 2],
    #[serde(deserialize_with = "lenient::or_default")]
    pub stats: UserStats,
    #[serde(deserialize_with = "settings")]
    pub settings: UserSettings,
    #[serde(deserialize_with = "lenient::or_default")]
    pub metadata: UserMetadata,
    #[serde(deserialize_with = "lenient::or_default")]
    pub referral_code: Option<String>,
    #[serde(deserialize_with = "lenient::optional_timestamp")]
    pub referral_generated_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub referred_by: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub telegram_chat_id: Option<i64>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub is_verified: bool,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub is_active: bool,
}

impl Default for User {
    fn default() -> Self {
        Self {
            id: String::new(),
            email: String::new(),
            nickname: String::new(),
            password_hash: String::new(),
            avatar: None,
            about: String::new(),
            status: Presence::default(),
            invisible: false,
            registered_at: DateTime::default(),
            last_seen: DateTime::default(),
            last_active: 0,
            position: DEFAULT_POSITION,
            stats: UserStats::default(),
            settings: UserSettings::default(),
            metadata: UserMetadata::default(),
            referral_code: None,
            referral_generated_at: None,
            referred_by: None,
            telegram_chat_id: None,
            is_verified: false,
            is_active: true,
        }
    }
}

impl Document for User {
    fn normalized(mut self) -> Self {
        self.email = normalize_email(&self.email);
        self.nickname = self.nickname.trim().to_string();
        if self.nickname.is_empty() {
            self.nickname = DEFAULT_NICKNAME.to_string();
        }
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            // id 없는 레코드는 email/nickname에서 결정적으로 만든 id를 받습니다
            self.id = format!("user_{}", stable_suffix(&self.email, &self.nickname));
        }
        if !is_valid_position(self.position) {
            self.position = DEFAULT_POSITION;
        }
        self.referral_code = self
            .referral_code
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty());
        self.referred_by = self.referred_by.filter(|r| !r.trim().is_empty());
        self.avatar = self.avatar.filter(|a| !a.is_empty());
        if !self.stats.total_distance.is_finite() || self.stats.total_distance < 0.0 {
            self.stats.total_distance = 0.0;
        }
        if !self.stats.online_hours.is_finite() || self.stats.online_hours < 0.0 {
            self.stats.online_hours = 0.0;
        }
        self.metadata.version = SCHEMA_VERSION;
        if self.metadata.created == DateTime::<Utc>::default() {
            self.metadata.created = self.registered_at;
        }
        if self.metadata.modified < self.metadata.created {
            self.metadata.modified = self.metadata.created;
        }
        self
    }
}

impl User {
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        let needle = identifier.trim().to_lowercase();
        !needle.is_empty()
            && (self.email == needle
                || self.nickname.to_lowercase() == needle
                || self.id.to_lowercase() == needle)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_position(position: [f64; 2]) -> bool {
    let [lat, lng] = position;
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

fn stable_suffix(email: &str, nickname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b"\0");
    hasher.update(nickname.to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn position<'de, D>(deserializer: D) -> Result<[f64; 2], D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value::<[f64; 2]>(value)
        .ok()
        .filter(|p| is_valid_position(*p))
        .unwrap_or(DEFAULT_POSITION))
}

fn settings<'de, D>(deserializer: D) -> Result<UserSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(lenient::document(value))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub nickname: String,
    pub password: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<i64>,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), AppError> {
        let email = normalize_email(&self.email);
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::InvalidInput("Invalid email address".to_string()));
        }
        if self.nickname.trim().is_empty() {
            return Err(AppError::InvalidInput("Nickname must not be empty".to_string()));
        }
        if self.password.chars().count() < 8 {
            return Err(AppError::InvalidInput(
                "Password must be at least 8 characters".to_string(),
            ));
        }
        Ok(())
    }
}

/// 사용자 수정 요청. 여기 없는 필드(email, id, isActive 등)는 역직렬화 단계에서 버려집니다.
///
/// `Option<Option<T>>` 필드는 "변경 없음(None)"과 "null로 지우기(Some(None))"를 구분합니다.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    pub nickname: Option<String>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub avatar: Option<Option<String>>,
    pub status: Option<Presence>,
    pub invisible: Option<bool>,
    pub position: Option<[f64; 2]>,
    pub about: Option<String>,
    pub settings: Option<UserSettings>,
    pub stats: Option<UserStats>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub referral_code: Option<Option<String>>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub referral_generated_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub referred_by: Option<Option<String>>,
    pub password: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_active: Option<i64>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub telegram_chat_id: Option<Option<i64>>,
}

impl UserPatch {
    /// 임의의 JSON 객체에서 허용된 필드만 추려 패치를 만듭니다.
    pub fn from_json(value: Value) -> Result<Self, AppError> {
        serde_json::from_value(value).map_err(|e| AppError::InvalidInput(format!("Invalid update: {}", e)))
    }
}

/// 외부에 보여주는 사용자 정보 (비밀번호 해시 제외)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub nickname: String,
    pub avatar: Option<String>,
    pub about: String,
    pub status: Presence,
    pub position: [f64; 2],
    pub stats: UserStats,
    pub settings: UserSettings,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_verified: bool,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            nickname: user.nickname,
            avatar: user.avatar,
            about: user.about,
            status: user.status,
            position: user.position,
            stats: user.stats,
            settings: user.settings,
            registered_at: user.registered_at,
            last_seen: user.last_seen,
            is_verified: user.is_verified,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CurrentSession {
    #[serde(alias = "id", deserialize_with = "lenient::or_default")]
    pub user_id: String,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub since: DateTime<Utc>,
}

impl Document for CurrentSession {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization_fills_defaults_and_coerces() {
        let user: User = lenient::document(json!({
            "id": "u1",
            "email": "  Alice@Example.COM ",
            "nickname": "   ",
            "status": "dancing",
            "position": ["north", 3],
            "stats": { "friendsCount": "4", "totalDistance": -3 },
            "settings": { "theme": "light", "privacy": 7 },
            "isActive": "yes"
        }));
        let user = user.normalized();

        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.nickname, DEFAULT_NICKNAME);
        assert_eq!(user.status, Presence::Offline);
        assert_eq!(user.position, DEFAULT_POSITION);
        assert_eq!(user.stats.friends_count, 4);
        assert_eq!(user.stats.total_distance, 0.0);
        assert_eq!(user.settings.theme, Theme::Light);
        assert_eq!(user.settings.privacy, Privacy::Public);
        assert!(user.settings.notifications);
        assert!(user.is_active);
        assert_eq!(user.metadata.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let user: User = lenient::document(json!({ "email": "B@x.io", "nickname": " Bob " }));
        let once = user.normalized();
        let twice = once.clone().normalized();

        assert_eq!(once, twice);
        assert!(once.id.starts_with("user_"));
    }

    #[test]
    fn test_patch_drops_fields_outside_the_allow_list() {
        let patch = UserPatch::from_json(json!({
            "nickname": "Neo",
            "email": "evil@x.io",
            "isActive": false,
            "id": "other",
            "avatar": null
        }))
        .unwrap();

        assert_eq!(patch.nickname.as_deref(), Some("Neo"));
        assert_eq!(patch.avatar, Some(None));
        assert!(patch.referred_by.is_none());
    }

    #[test]
    fn test_patch_with_wrong_types_is_invalid_input() {
        let err = UserPatch::from_json(json!({ "invisible": "sometimes" })).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_new_user_validation() {
        let mut input = NewUser {
            email: "a@b.c".into(),
            nickname: "Ann".into(),
            password: "longenough".into(),
            ..NewUser::default()
        };
        assert!(input.validate().is_ok());

        input.password = "short".into();
        assert!(matches!(input.validate(), Err(AppError::InvalidInput(_))));

        input.password = "longenough".into();
        input.email = "not-an-email".into();
        assert!(matches!(input.validate(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_identifier_matching_is_case_insensitive() {
        let user = User {
            id: "user_1".into(),
            email: "ann@x.io".into(),
            nickname: "Ann".into(),
            ..User::default()
        };
        assert!(user.matches_identifier(" ANN "));
        assert!(user.matches_identifier("Ann@X.io"));
        assert!(user.matches_identifier("USER_1"));
        assert!(!user.matches_identifier(""));
    }
}
