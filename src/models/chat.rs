//! # 채팅 모델 정의
//!
//! - `Chat`: 1:1 개인 채팅. 참여자마다 자기 사본을 가지며, 사본끼리는 `unread_count`만 다릅니다.
//! - `GlobalChat`: 모든 사용자가 참여하는 공용 채팅 (`global_chat_meetup`)
//! - `Message`: 개인/공용 채팅이 공유하는 메시지 형식
//! - `ChatIndexEntry`: chatId → 참여자 목록 인덱스

use crate::db::collection::{keep_last, single_document, Document};
use crate::db::lenient;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GLOBAL_CHAT_ID: &str = "global_chat_meetup";
pub const SYSTEM_SENDER: &str = "system";
/// 삭제된 사용자가 보낸 메시지의 발신자 id
pub const DELETED_USER: &str = "deleted_user";
pub const GLOBAL_MESSAGE_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    User,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub sender_id: String,
    #[serde(deserialize_with = "lenient::or_default", skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub text: String,
    #[serde(deserialize_with = "lenient::millis")]
    pub timestamp: i64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub read: bool,
    #[serde(deserialize_with = "lenient::or_default", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub attachments: Value,
    #[serde(deserialize_with = "lenient::or_default")]
    pub edited: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub deleted: bool,
    #[serde(rename = "type", deserialize_with = "lenient::or_default")]
    pub kind: MessageKind,
    #[serde(deserialize_with = "lenient::or_default")]
    pub is_welcome: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Chat {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::list")]
    pub participants: Vec<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub messages: Vec<Message>,
    #[serde(deserialize_with = "lenient::millis")]
    pub created_at: i64,
    #[serde(deserialize_with = "lenient::millis")]
    pub last_message_at: i64,
    #[serde(deserialize_with = "lenient::count")]
    pub unread_count: u64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub is_group: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub name: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub avatar: Option<String>,
    pub custom_data: Value,
}

impl Document for Chat {
    fn normalized(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.participants.len());
        for participant in self.participants.drain(..) {
            let participant = participant.trim().to_string();
            if !participant.is_empty() && !seen.contains(&participant) {
                seen.push(participant);
            }
        }
        self.participants = seen;
        if self.last_message_at == 0 {
            self.last_message_at = self.created_at;
        }
        if !self.custom_data.is_object() {
            self.custom_data = Value::Object(Default::default());
        }
        self
    }
}

impl Chat {
    /// 정렬 기준 시각 (`lastMessageAt`, 없으면 `createdAt`)
    pub fn activity_at(&self) -> i64 {
        if self.last_message_at > 0 {
            self.last_message_at
        } else {
            self.created_at
        }
    }

    pub fn is_direct_with(&self, a: &str, b: &str) -> bool {
        !self.is_group
            && self.participants.len() == 2
            && self.participants.iter().any(|p| p == a)
            && self.participants.iter().any(|p| p == b)
    }

    /// 채팅 목록에 보여줄 마지막 메시지 요약
    pub fn last_message_preview(&self) -> MessagePreview {
        match self.messages.last() {
            None => MessagePreview {
                text: "No messages".to_string(),
                timestamp: self.created_at,
                is_empty: true,
                is_deleted: false,
                sender_id: None,
            },
            Some(m) if m.deleted => MessagePreview {
                text: "Message deleted".to_string(),
                timestamp: m.timestamp,
                is_empty: false,
                is_deleted: true,
                sender_id: Some(m.sender_id.clone()),
            },
            Some(m) => MessagePreview {
                text: m.text.clone(),
                timestamp: m.timestamp,
                is_empty: false,
                is_deleted: false,
                sender_id: Some(m.sender_id.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub text: String,
    pub timestamp: i64,
    pub is_empty: bool,
    pub is_deleted: bool,
    pub sender_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalChatSettings {
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub allow_images: bool,
    #[serde(deserialize_with = "lenient::count")]
    pub max_message_length: u64,
    /// 초당 메시지 수 (저장만 하고 강제하지 않음)
    #[serde(deserialize_with = "lenient::count")]
    pub rate_limit: u64,
}

impl Default for GlobalChatSettings {
    fn default() -> Self {
        Self {
            allow_images: true,
            max_message_length: 1000,
            rate_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalChat {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub name: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub description: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub avatar: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub participants: Vec<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub messages: Vec<Message>,
    #[serde(deserialize_with = "lenient::millis")]
    pub created_at: i64,
    #[serde(deserialize_with = "lenient::millis")]
    pub last_message_at: i64,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub is_global: bool,
    #[serde(deserialize_with = "lenient::count")]
    pub total_messages: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub participant_count: u64,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub cannot_be_deleted: bool,
    #[serde(deserialize_with = "settings")]
    pub settings: GlobalChatSettings,
}

impl Default for GlobalChat {
    fn default() -> Self {
        Self {
            id: GLOBAL_CHAT_ID.to_string(),
            name: "MeetUP community chat".to_string(),
            description: "The main MeetUP community chat. Every user can talk here.".to_string(),
            avatar: Some("meetup-logo.png".to_string()),
            participants: Vec::new(),
            messages: Vec::new(),
            created_at: 0,
            last_message_at: 0,
            is_global: true,
            total_messages: 0,
            participant_count: 0,
            cannot_be_deleted: true,
            settings: GlobalChatSettings::default(),
        }
    }
}

impl Document for GlobalChat {
    fn normalized(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = GLOBAL_CHAT_ID.to_string();
        }
        if self.settings.max_message_length == 0 {
            self.settings.max_message_length = GlobalChatSettings::default().max_message_length;
        }
        keep_last(&mut self.messages, GLOBAL_MESSAGE_CAP);
        self.participant_count = self.participants.len() as u64;
        self.total_messages = self.total_messages.max(self.messages.len() as u64);
        self
    }
}

fn settings<'de, D>(deserializer: D) -> Result<GlobalChatSettings, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(lenient::document(value))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatIndexEntry {
    #[serde(deserialize_with = "lenient::list")]
    pub participants: Vec<String>,
    #[serde(deserialize_with = "lenient::millis")]
    pub last_updated: i64,
}

impl Document for ChatIndexEntry {}

single_document!(ChatIndexEntry);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub message: Message,
    pub chat_id: String,
    pub chat_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSystemStats {
    pub total_users: u64,
    pub total_private_chats: u64,
    pub total_messages: u64,
    pub global_chat_messages: u64,
    pub storage_keys: Vec<String>,
}

/// id로 찾은 채팅. 공용 채팅과 개인 채팅은 형태가 다릅니다.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatView {
    Private(Chat),
    Global(GlobalChat),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_normalization() {
        let chat: Chat = lenient::document(json!({
            "id": "chat_1",
            "participants": [" a ", "b", "a", 3, ""],
            "messages": [{ "id": "m1", "senderId": "a", "text": "hi", "timestamp": "5" }, "junk"],
            "createdAt": 10,
            "customData": "nope"
        }));
        let chat = chat.normalized();

        assert_eq!(chat.participants, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].timestamp, 5);
        assert_eq!(chat.last_message_at, 10);
        assert!(chat.custom_data.is_object());
    }

    #[test]
    fn test_last_message_preview() {
        let mut chat = Chat { created_at: 7, ..Chat::default() };
        assert!(chat.last_message_preview().is_empty);
        assert_eq!(chat.last_message_preview().timestamp, 7);

        chat.messages.push(Message { text: "gone".into(), deleted: true, timestamp: 9, ..Message::default() });
        let preview = chat.last_message_preview();
        assert!(preview.is_deleted);
        assert_eq!(preview.text, "Message deleted");
    }

    #[test]
    fn test_global_chat_keeps_newest_messages() {
        let mut global = GlobalChat::default();
        global.messages = (0..GLOBAL_MESSAGE_CAP + 5)
            .map(|i| Message { id: format!("m{}", i), timestamp: i as i64, ..Message::default() })
            .collect();
        let global = global.normalized();

        assert_eq!(global.messages.len(), GLOBAL_MESSAGE_CAP);
        assert_eq!(global.messages[0].id, "m5");
    }
}
