use crate::db::collection::Document;
use crate::db::lenient;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(rename = "viaQR", alias = "viaQr", deserialize_with = "lenient::or_default")]
    pub via_qr: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FriendRequest {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub from_user_id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub to_user_id: String,
    #[serde(deserialize_with = "lenient::millis")]
    pub timestamp: i64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub status: RequestStatus,
    #[serde(deserialize_with = "lenient::or_default", skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<i64>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub metadata: RequestMetadata,
}

impl Document for FriendRequest {
    fn normalized(mut self) -> Self {
        self.from_user_id = self.from_user_id.trim().to_string();
        self.to_user_id = self.to_user_id.trim().to_string();
        self
    }
}

impl FriendRequest {
    /// 방향과 무관하게 두 사용자 사이의 요청인지
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.from_user_id == a && self.to_user_id == b) || (self.from_user_id == b && self.to_user_id == a)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.from_user_id == user_id || self.to_user_id == user_id
    }

    /// 상대방 id
    pub fn other_party(&self, user_id: &str) -> Option<&str> {
        if self.from_user_id == user_id {
            Some(&self.to_user_id)
        } else if self.to_user_id == user_id {
            Some(&self.from_user_id)
        } else {
            None
        }
    }
}
