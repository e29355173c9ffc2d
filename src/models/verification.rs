use crate::db::collection::Document;
use crate::db::lenient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePurpose {
    #[default]
    Verification,
    PasswordReset,
}

/// 발급된 일회용 코드. 코드 자체는 저장하지 않고 SHA-256 해시만 저장합니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationCode {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub user_id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub purpose: CodePurpose,
    #[serde(deserialize_with = "lenient::or_default")]
    pub code_hash: String,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub expires_at: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::count")]
    pub attempts: u64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub consumed: bool,
}

impl Document for VerificationCode {}

impl VerificationCode {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && self.expires_at > now
    }
}

/// 전송된 메시지 (데모 모드의 outbox에 쌓입니다)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub text: String,
}
