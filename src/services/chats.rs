//! # 채팅 시스템
//!
//! ## 저장 구조
//! - `meetup_chats_v2`: userId → 그 사용자가 가진 채팅 사본 목록
//! - `meetup_global_chat_v2`: 공용 채팅 하나
//! - `meetup_chat_index`: chatId → 참여자, 마지막 갱신 시각
//!
//! 개인 채팅은 참여자마다 사본을 가집니다. 메시지를 보내면 모든 사본에 같은 메시지가 추가되고,
//! 보낸 사람이 아닌 참여자의 사본에서만 `unreadCount`가 올라갑니다.
//!
//! ## 이전 버전 데이터
//! `init()`은 v2 슬롯이 아직 없을 때만 `meetup_chats`, `meetup_global_chat`을 옮겨 옵니다.

use crate::clock::SharedClock;
use crate::db::collection::{Collection, Stored, StoreOptions};
use crate::db::kv::KvStore;
use crate::error::AppError;
use crate::models::chat::*;
use serde_json::Value;
use std::collections::BTreeMap;

pub const CHATS_KEY: &str = "meetup_chats_v2";
pub const GLOBAL_CHAT_KEY: &str = "meetup_global_chat_v2";
pub const CHAT_INDEX_KEY: &str = "meetup_chat_index";
pub const LEGACY_CHATS_KEY: &str = "meetup_chats";
pub const LEGACY_GLOBAL_CHAT_KEY: &str = "meetup_global_chat";

const SYSTEM_NAME: &str = "MeetUP System";
const DELETED_USER_NAME: &str = "Deleted user";

type ChatsByUser = BTreeMap<String, Vec<Chat>>;

#[derive(Clone)]
pub struct ChatSystem {
    kv: KvStore,
    chats: Collection<ChatsByUser>,
    global: Collection<Option<GlobalChat>>,
    index: Collection<BTreeMap<String, ChatIndexEntry>>,
    clock: SharedClock,
}

impl ChatSystem {
    pub fn new(kv: KvStore, options: StoreOptions, clock: SharedClock) -> Self {
        Self {
            chats: Collection::new(kv.clone(), CHATS_KEY, options),
            global: Collection::new(kv.clone(), GLOBAL_CHAT_KEY, options),
            index: Collection::new(kv.clone(), CHAT_INDEX_KEY, options),
            kv,
            clock,
        }
    }

    /// 이전 버전 데이터를 옮기고 공용 채팅을 준비합니다.
    pub async fn init(&self) -> Result<ChatSystemStats, AppError> {
        self.migrate_legacy().await?;
        self.initialize_global_chat().await?;
        let stats = self.stats().await?;
        tracing::info!(
            private_chats = stats.total_private_chats,
            messages = stats.total_messages,
            "Chat system ready"
        );
        Ok(stats)
    }

    /// v2 슬롯이 없고 예전 슬롯이 있을 때만 옮깁니다. 옮긴 슬롯이 있으면 `true`.
    pub async fn migrate_legacy(&self) -> Result<bool, AppError> {
        let mut migrated = false;

        if !self.chats.exists().await? {
            if let Some(old) = self.read_legacy(LEGACY_CHATS_KEY).await? {
                let chats = ChatsByUser::from_json(old);
                if !chats.is_empty() {
                    self.chats.save(chats).await?;
                    migrated = true;
                }
            }
        }

        if !self.global.exists().await? {
            if let Some(old) = self.read_legacy(LEGACY_GLOBAL_CHAT_KEY).await? {
                if let Some(global) = <Option<GlobalChat>>::from_json(old) {
                    self.global.save(Some(global)).await?;
                    migrated = true;
                }
            }
        }

        if migrated {
            tracing::info!("Legacy chat data migrated");
        }
        Ok(migrated)
    }

    async fn read_legacy(&self, key: &str) -> Result<Option<Value>, AppError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Unreadable legacy chat slot skipped");
                Ok(None)
            }
        }
    }

    // ===== 개인 채팅 =====

    /// 사용자의 채팅 목록 (최근 활동 순)
    pub async fn user_chats(&self, user_id: &str) -> Result<Vec<Chat>, AppError> {
        if user_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut chats = self.chats.load().await?.remove(user_id).unwrap_or_default();
        chats.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
        Ok(chats)
    }

    /// 두 사용자 사이의 채팅. 이미 있으면 기존 채팅을 반환합니다.
    pub async fn create_chat(&self, a: &str, b: &str, name: Option<&str>) -> Result<Chat, AppError> {
        let (a, b) = (a.trim(), b.trim());
        if a.is_empty() || b.is_empty() {
            return Err(AppError::InvalidInput("Invalid user ids".to_string()));
        }
        if a == b {
            return Err(AppError::InvalidInput("A chat needs two different users".to_string()));
        }

        let now = self.clock.now_millis();
        let chat = Chat {
            id: format!("chat_{}", uuid::Uuid::now_v7()),
            participants: vec![a.to_string(), b.to_string()],
            created_at: now,
            last_message_at: now,
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Chat {} and {}", a, b)),
            ..Chat::default()
        };

        let (chat, created) = self
            .chats
            .mutate(|chats| {
                if let Some(existing) = chats
                    .get(a)
                    .and_then(|list| list.iter().find(|c| c.is_direct_with(a, b)))
                {
                    return Ok((existing.clone(), false));
                }
                // a가 지운 채팅이라도 b에게 사본이 남아 있으면 그 대화를 되살립니다
                let surviving = chats
                    .values()
                    .flat_map(|list| list.iter())
                    .find(|c| c.is_direct_with(a, b))
                    .cloned();
                if let Some(mut restored) = surviving {
                    restored.unread_count = 0;
                    chats.entry(a.to_string()).or_default().push(restored.clone());
                    return Ok((restored, false));
                }
                chats.entry(a.to_string()).or_default().push(chat.clone());
                chats.entry(b.to_string()).or_default().push(chat.clone());
                Ok((chat, true))
            })
            .await?;

        if created {
            self.touch_index(&chat.id, &chat.participants).await?;
            tracing::debug!(chat_id = %chat.id, "Chat created");
        }
        Ok(chat)
    }

    pub async fn find_chat(&self, a: &str, b: &str) -> Result<Option<Chat>, AppError> {
        Ok(self
            .user_chats(a)
            .await?
            .into_iter()
            .find(|c| c.is_direct_with(a, b)))
    }

    pub async fn send_message(&self, chat_id: &str, sender_id: &str, text: &str) -> Result<Message, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidInput("Message text must not be empty".to_string()));
        }

        let message = Message {
            id: format!("msg_{}", uuid::Uuid::now_v7()),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            timestamp: self.clock.now_millis(),
            ..Message::default()
        };

        let participants = self
            .chats
            .mutate(|chats| {
                // 사본끼리 메시지는 같으므로 아무 사본이나 참여자 목록의 기준으로 씁니다
                let template = find_copy(chats, chat_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Chat {}", chat_id)))?;
                if !template.participants.iter().any(|p| p == sender_id) {
                    return Err(AppError::InvalidInput(
                        "The sender is not a participant of this chat".to_string(),
                    ));
                }

                // 보낸 사람 사본은 안 읽은 수가 그대로이고, 나머지 사본만 1 늘어납니다
                for participant in &template.participants {
                    let list = chats.entry(participant.clone()).or_default();
                    let copy = match list.iter_mut().position(|c| c.id == chat_id) {
                        Some(i) => &mut list[i],
                        None => {
                            // 사본이 없는 참여자에게는 새 사본을 만들어 줍니다
                            list.push(Chat { unread_count: 0, ..template.clone() });
                            let last = list.len() - 1;
                            &mut list[last]
                        }
                    };
                    copy.messages.push(message.clone());
                    copy.last_message_at = message.timestamp;
                    if participant != sender_id {
                        copy.unread_count += 1;
                    }
                }
                Ok(template.participants)
            })
            .await?;

        self.touch_index(chat_id, &participants).await?;
        Ok(message)
    }

    /// 시간 오름차순. `limit`이 0이면 전부.
    pub async fn chat_messages(&self, chat_id: &str, limit: usize, offset: usize) -> Result<Vec<Message>, AppError> {
        let chats = self.chats.load().await?;
        Ok(find_copy(&chats, chat_id)
            .map(|chat| paginate(chat.messages.clone(), limit, offset))
            .unwrap_or_default())
    }

    /// 사용자 사본의 안 읽은 수를 0으로 만들고, 다른 사람이 보낸 메시지를 모든 사본에서 읽음 처리합니다.
    pub async fn mark_as_read(&self, chat_id: &str, user_id: &str) -> Result<bool, AppError> {
        let now = self.clock.now_millis();
        self.chats
            .mutate(|chats| {
                let has_copy = chats
                    .get(user_id)
                    .is_some_and(|list| list.iter().any(|c| c.id == chat_id));
                if !has_copy {
                    return Ok(false);
                }

                // 읽음 표시는 메시지 자체의 상태라서 상대방 사본에도 반영해야 합니다.
                // 안 읽은 수는 사본마다 따로이므로 본인 것만 0으로 만듭니다.
                for (owner, list) in chats.iter_mut() {
                    for chat in list.iter_mut().filter(|c| c.id == chat_id) {
                        if owner == user_id {
                            chat.unread_count = 0;
                        }
                        for message in chat.messages.iter_mut() {
                            if message.sender_id != user_id && !message.read {
                                message.read = true;
                                message.read_at = Some(now);
                            }
                        }
                    }
                }
                Ok(true)
            })
            .await
    }

    pub async fn delete_chat_for_user(&self, chat_id: &str, user_id: &str) -> Result<bool, AppError> {
        let deleted = self
            .chats
            .mutate(|chats| {
                let Some(list) = chats.get_mut(user_id) else {
                    return Ok(false);
                };
                let before = list.len();
                list.retain(|c| c.id != chat_id);
                Ok(list.len() != before)
            })
            .await?;

        if deleted {
            tracing::debug!(chat_id, user_id, "Chat deleted for user");
        }
        Ok(deleted)
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64, AppError> {
        Ok(self
            .user_chats(user_id)
            .await?
            .iter()
            .map(|c| c.unread_count)
            .sum())
    }

    /// 사용자의 채팅에서 메시지를 찾습니다 (대소문자 무시, 최신순).
    /// 앞뒤 공백을 뺀 검색어가 2글자 미만이면 빈 결과입니다. `limit`이 0이면 전부.
    pub async fn search_messages(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let needle = query.trim().to_lowercase();
        if needle.chars().count() < 2 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .user_chats(user_id)
            .await?
            .into_iter()
            .flat_map(|chat| {
                let (chat_id, chat_name) = (chat.id, chat.name);
                chat.messages
                    .into_iter()
                    .filter(|m| !m.deleted && m.text.to_lowercase().contains(&needle))
                    .map(move |message| SearchHit {
                        message,
                        chat_id: chat_id.clone(),
                        chat_name: chat_name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        hits.sort_by(|a, b| b.message.timestamp.cmp(&a.message.timestamp));
        if limit > 0 {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    // ===== 공용 채팅 =====

    pub async fn global_chat(&self) -> Result<Option<GlobalChat>, AppError> {
        self.global.load().await
    }

    /// 공용 채팅이 없으면 환영 메시지 두 개와 함께 만듭니다.
    pub async fn initialize_global_chat(&self) -> Result<GlobalChat, AppError> {
        if let Some(global) = self.global.load().await? {
            return Ok(global);
        }
        let global = self.fresh_global_chat();
        self.global.save(Some(global.clone())).await?;
        tracing::info!("Global chat initialized");
        Ok(global)
    }

    pub async fn send_global_message(
        &self,
        sender_id: &str,
        sender_name: Option<&str>,
        text: &str,
    ) -> Result<Message, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidInput("Message text must not be empty".to_string()));
        }

        let message = Message {
            id: format!("global_msg_{}", uuid::Uuid::now_v7()),
            sender_id: sender_id.to_string(),
            sender_name: Some(
                sender_name
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("User {}", sender_id)),
            ),
            text: text.to_string(),
            timestamp: self.clock.now_millis(),
            ..Message::default()
        };
        let fresh = self.fresh_global_chat();

        self.global
            .mutate(|global| {
                let global = global.get_or_insert(fresh);
                let max = global.settings.max_message_length as usize;
                if message.text.chars().count() > max {
                    return Err(AppError::InvalidInput(format!(
                        "Message is longer than {} characters",
                        max
                    )));
                }

                global.messages.push(message.clone());
                global.last_message_at = message.timestamp;
                global.total_messages += 1;
                Ok(message)
            })
            .await
    }

    pub async fn global_messages(&self, limit: usize, offset: usize) -> Result<Vec<Message>, AppError> {
        Ok(self
            .global
            .load()
            .await?
            .map(|g| paginate(g.messages, limit, offset))
            .unwrap_or_default())
    }

    fn fresh_global_chat(&self) -> GlobalChat {
        let now = self.clock.now_millis();
        let welcome = |id: &str, text: &str, timestamp: i64| Message {
            id: id.to_string(),
            sender_id: SYSTEM_SENDER.to_string(),
            sender_name: Some(SYSTEM_NAME.to_string()),
            text: text.to_string(),
            timestamp,
            read: true,
            kind: MessageKind::System,
            is_welcome: true,
            ..Message::default()
        };

        GlobalChat {
            messages: vec![
                welcome(
                    "welcome_message_1",
                    "Welcome to the MeetUP community chat! Here you can talk with everyone in the community.",
                    now,
                ),
                welcome(
                    "welcome_message_2",
                    "Chat rules: 1. Respect other members. 2. Do not spam. 3. Share useful information about meetups.",
                    now + 1000,
                ),
            ],
            created_at: now,
            last_message_at: now,
            total_messages: 2,
            ..GlobalChat::default()
        }
    }

    // ===== 공통 =====

    pub async fn chat_by_id(&self, chat_id: &str, user_id: Option<&str>) -> Result<Option<ChatView>, AppError> {
        if chat_id == GLOBAL_CHAT_ID {
            return Ok(self.global.load().await?.map(ChatView::Global));
        }
        let chat = match user_id {
            Some(user_id) => self
                .user_chats(user_id)
                .await?
                .into_iter()
                .find(|c| c.id == chat_id),
            None => find_copy(&self.chats.load().await?, chat_id).cloned(),
        };
        Ok(chat.map(ChatView::Private))
    }

    /// 공용/개인 채팅 구분 없이 보냅니다.
    pub async fn send_to_chat(
        &self,
        chat_id: &str,
        sender_id: &str,
        sender_name: Option<&str>,
        text: &str,
    ) -> Result<Message, AppError> {
        if chat_id == GLOBAL_CHAT_ID {
            self.send_global_message(sender_id, sender_name, text).await
        } else {
            self.send_message(chat_id, sender_id, text).await
        }
    }

    pub async fn messages(&self, chat_id: &str, limit: usize, offset: usize) -> Result<Vec<Message>, AppError> {
        if chat_id == GLOBAL_CHAT_ID {
            self.global_messages(limit, offset).await
        } else {
            self.chat_messages(chat_id, limit, offset).await
        }
    }

    pub async fn stats(&self) -> Result<ChatSystemStats, AppError> {
        let chats = self.chats.load().await?;
        let global_chat_messages = self
            .global
            .load()
            .await?
            .map_or(0, |g| g.messages.len() as u64);

        let owners = chats.values().filter(|list| !list.is_empty());
        let total_users = owners.clone().count() as u64;
        let total_private_chats: u64 = owners.clone().map(|list| list.len() as u64).sum();
        let private_messages: u64 = owners
            .flat_map(|list| list.iter())
            .map(|c| c.messages.len() as u64)
            .sum();

        Ok(ChatSystemStats {
            total_users,
            total_private_chats,
            total_messages: private_messages + global_chat_messages,
            global_chat_messages,
            storage_keys: vec![
                CHATS_KEY.to_string(),
                GLOBAL_CHAT_KEY.to_string(),
                CHAT_INDEX_KEY.to_string(),
            ],
        })
    }

    /// 사용자를 채팅에서 지웁니다. 그 사용자가 쓴 메시지는 `deleted_user`가 보낸 것으로 바뀝니다.
    /// 영향을 받은 개인 채팅 사본 수를 반환합니다.
    pub async fn remove_participant(&self, user_id: &str) -> Result<usize, AppError> {
        let touched = self
            .chats
            .mutate(|chats| {
                // 본인 사본은 통째로 지우고, 상대방 사본에는 대화 내용을 남깁니다
                let mut touched = chats.remove(user_id).map_or(0, |list| list.len());
                for chat in chats.values_mut().flat_map(|list| list.iter_mut()) {
                    let before = chat.participants.len();
                    chat.participants.retain(|p| p != user_id);
                    let renamed = anonymize(&mut chat.messages, user_id);
                    if renamed > 0 || chat.participants.len() != before {
                        touched += 1;
                    }
                }
                Ok(touched)
            })
            .await?;

        // 참여자가 모두 사라진 채팅은 인덱스에서도 뺍니다
        self.index
            .mutate(|index| {
                for entry in index.values_mut() {
                    entry.participants.retain(|p| p != user_id);
                }
                index.retain(|_, entry| !entry.participants.is_empty());
                Ok(())
            })
            .await?;

        if self.global.load().await?.is_some() {
            self.global
                .mutate(|global| {
                    if let Some(global) = global {
                        global.participants.retain(|p| p != user_id);
                        anonymize(&mut global.messages, user_id);
                    }
                    Ok(())
                })
                .await?;
        }

        tracing::debug!(user_id, touched, "Participant removed from chats");
        Ok(touched)
    }

    pub fn clear_cache(&self) {
        self.chats.clear_cache();
        self.global.clear_cache();
        self.index.clear_cache();
    }

    async fn touch_index(&self, chat_id: &str, participants: &[String]) -> Result<(), AppError> {
        let now = self.clock.now_millis();
        self.index
            .mutate(|index| {
                index.insert(
                    chat_id.to_string(),
                    ChatIndexEntry {
                        participants: participants.to_vec(),
                        last_updated: now,
                    },
                );
                Ok(())
            })
            .await
    }
}

/// 아무 사용자의 사본이든 처음 찾은 것
fn find_copy<'a>(chats: &'a ChatsByUser, chat_id: &str) -> Option<&'a Chat> {
    chats
        .values()
        .flat_map(|list| list.iter())
        .find(|c| c.id == chat_id)
}

fn paginate(mut messages: Vec<Message>, limit: usize, offset: usize) -> Vec<Message> {
    messages.sort_by_key(|m| m.timestamp);
    let take = if limit == 0 { usize::MAX } else { limit };
    messages.into_iter().skip(offset).take(take).collect()
}

fn anonymize(messages: &mut [Message], user_id: &str) -> usize {
    let mut renamed = 0;
    for message in messages.iter_mut().filter(|m| m.sender_id == user_id) {
        message.sender_id = DELETED_USER.to_string();
        if message.sender_name.is_some() {
            message.sender_name = Some(DELETED_USER_NAME.to_string());
        }
        renamed += 1;
    }
    renamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::connect_in_memory;
    use chrono::Duration;
    use std::sync::Arc;

    async fn system() -> (ChatSystem, ManualClock, KvStore) {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339("2024-05-01T09:00:00+03:00").unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        let system = ChatSystem::new(kv.clone(), StoreOptions::default(), Arc::new(clock.clone()));
        (system, clock, kv)
    }

    #[tokio::test]
    async fn test_create_chat_is_idempotent_per_pair() {
        let (chats, _, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();
        let again = chats.create_chat("bob", "ann", Some("other")).await.unwrap();

        assert_eq!(chat.id, again.id);
        assert_eq!(chat.name, "Chat ann and bob");
        assert_eq!(chats.user_chats("ann").await.unwrap().len(), 1);
        assert_eq!(chats.user_chats("bob").await.unwrap().len(), 1);
        assert_eq!(chats.find_chat("bob", "ann").await.unwrap().unwrap().id, chat.id);

        assert!(matches!(chats.create_chat("ann", "ann", None).await, Err(AppError::InvalidInput(_))));
        assert!(matches!(chats.create_chat(" ", "bob", None).await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_send_updates_every_copy_and_unread_counts() {
        let (chats, clock, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();

        clock.advance(Duration::seconds(5));
        let message = chats.send_message(&chat.id, "ann", "  hello bob ").await.unwrap();
        assert_eq!(message.text, "hello bob");

        let ann_copy = &chats.user_chats("ann").await.unwrap()[0];
        let bob_copy = &chats.user_chats("bob").await.unwrap()[0];
        assert_eq!(ann_copy.messages, bob_copy.messages);
        assert_eq!(ann_copy.unread_count, 0);
        assert_eq!(bob_copy.unread_count, 1);
        assert_eq!(bob_copy.last_message_at, message.timestamp);

        assert!(matches!(chats.send_message(&chat.id, "ann", "   ").await, Err(AppError::InvalidInput(_))));
        assert!(matches!(chats.send_message("nope", "ann", "hi").await, Err(AppError::NotFound(_))));
        assert!(matches!(chats.send_message(&chat.id, "eve", "hi").await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_mark_as_read() {
        let (chats, _, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();
        chats.send_message(&chat.id, "ann", "one").await.unwrap();
        chats.send_message(&chat.id, "ann", "two").await.unwrap();
        assert_eq!(chats.unread_count("bob").await.unwrap(), 2);

        assert!(chats.mark_as_read(&chat.id, "bob").await.unwrap());
        assert_eq!(chats.unread_count("bob").await.unwrap(), 0);
        let ann_copy = &chats.user_chats("ann").await.unwrap()[0];
        assert!(ann_copy.messages.iter().all(|m| m.read && m.read_at.is_some()));

        assert!(!chats.mark_as_read(&chat.id, "eve").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_chats_sorted_by_activity_and_pagination() {
        let (chats, clock, _) = system().await;
        let first = chats.create_chat("ann", "bob", None).await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = chats.create_chat("ann", "carol", None).await.unwrap();
        clock.advance(Duration::seconds(1));
        for text in ["a", "b", "c"] {
            chats.send_message(&first.id, "bob", text).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        let ids: Vec<String> = chats.user_chats("ann").await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);

        let page: Vec<String> = chats
            .chat_messages(&first.id, 2, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(page, vec!["b", "c"]);
        assert_eq!(chats.messages(&first.id, 0, 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_search_messages() {
        let (chats, clock, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();
        chats.send_message(&chat.id, "ann", "Meet at the park").await.unwrap();
        clock.advance(Duration::seconds(1));
        chats.send_message(&chat.id, "bob", "which PARK?").await.unwrap();

        assert!(chats.search_messages("ann", " p ", 10).await.unwrap().is_empty());
        let hits = chats.search_messages("ann", "park", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message.text, "which PARK?");
        assert_eq!(hits[0].chat_id, chat.id);
        assert_eq!(chats.search_messages("ann", "park", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_global_chat() {
        let (chats, clock, _) = system().await;
        let global = chats.initialize_global_chat().await.unwrap();
        assert_eq!(global.id, GLOBAL_CHAT_ID);
        assert_eq!(global.messages.len(), 2);
        assert!(global.messages.iter().all(|m| m.is_welcome && m.kind == MessageKind::System));

        clock.advance(Duration::seconds(5));
        let message = chats.send_to_chat(GLOBAL_CHAT_ID, "ann", None, "hi all").await.unwrap();
        assert_eq!(message.sender_name.as_deref(), Some("User ann"));

        let too_long = "x".repeat(1001);
        assert!(matches!(
            chats.send_global_message("ann", Some("Ann"), &too_long).await,
            Err(AppError::InvalidInput(_))
        ));

        let global = chats.global_chat().await.unwrap().unwrap();
        assert_eq!(global.total_messages, 3);
        assert_eq!(chats.messages(GLOBAL_CHAT_ID, 1, 2).await.unwrap()[0].text, "hi all");
        assert!(matches!(chats.chat_by_id(GLOBAL_CHAT_ID, None).await.unwrap(), Some(ChatView::Global(_))));
    }

    #[tokio::test]
    async fn test_legacy_migration_only_without_v2_slot() {
        let (chats, _, kv) = system().await;
        kv.put(
            LEGACY_CHATS_KEY,
            r#"{"ann":[{"id":"chat_old","participants":["ann","bob"],"messages":[],"createdAt":5}]}"#,
        )
        .await
        .unwrap();

        let stats = chats.init().await.unwrap();
        assert_eq!(stats.total_private_chats, 1);
        assert_eq!(stats.global_chat_messages, 2);
        assert_eq!(chats.user_chats("ann").await.unwrap()[0].id, "chat_old");

        kv.put(LEGACY_CHATS_KEY, r#"{"zed":[{"id":"other"}]}"#).await.unwrap();
        assert!(!chats.migrate_legacy().await.unwrap());
        assert!(chats.user_chats("zed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_participant_rewrites_authorship() {
        let (chats, _, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();
        chats.send_message(&chat.id, "ann", "bye").await.unwrap();
        chats.send_global_message("ann", Some("Ann"), "hello").await.unwrap();

        chats.remove_participant("ann").await.unwrap();

        assert!(chats.user_chats("ann").await.unwrap().is_empty());
        let bob_copy = &chats.user_chats("bob").await.unwrap()[0];
        assert_eq!(bob_copy.participants, vec!["bob".to_string()]);
        assert_eq!(bob_copy.messages[0].sender_id, DELETED_USER);

        let global = chats.global_chat().await.unwrap().unwrap();
        let last = global.messages.last().unwrap();
        assert_eq!(last.sender_id, DELETED_USER);
        assert_eq!(last.sender_name.as_deref(), Some("Deleted user"));
    }

    #[tokio::test]
    async fn test_delete_chat_for_one_user_only() {
        let (chats, _, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();

        assert!(chats.delete_chat_for_user(&chat.id, "ann").await.unwrap());
        assert!(!chats.delete_chat_for_user(&chat.id, "ann").await.unwrap());
        assert!(chats.user_chats("ann").await.unwrap().is_empty());
        assert_eq!(chats.user_chats("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_chat_restores_deleted_copy() {
        let (chats, _, _) = system().await;
        let chat = chats.create_chat("ann", "bob", None).await.unwrap();
        chats.send_message(&chat.id, "bob", "still there?").await.unwrap();
        chats.delete_chat_for_user(&chat.id, "ann").await.unwrap();

        let again = chats.create_chat("ann", "bob", None).await.unwrap();
        assert_eq!(again.id, chat.id);
        assert_eq!(again.unread_count, 0);

        let ann_chats = chats.user_chats("ann").await.unwrap();
        assert_eq!(ann_chats.len(), 1);
        assert_eq!(ann_chats[0].messages[0].text, "still there?");
        assert_eq!(chats.user_chats("bob").await.unwrap().len(), 1);

        // 양쪽 모두 지웠다면 새 채팅
        chats.delete_chat_for_user(&chat.id, "ann").await.unwrap();
        chats.delete_chat_for_user(&chat.id, "bob").await.unwrap();
        let fresh = chats.create_chat("bob", "ann", None).await.unwrap();
        assert_ne!(fresh.id, chat.id);
    }

    #[tokio::test]
    async fn test_global_chat_is_capped_on_send() {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339("2024-05-01T09:00:00+03:00").unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        let options = StoreOptions { backup_limit: 0, ..StoreOptions::default() };
        let chats = ChatSystem::new(kv, options, Arc::new(clock.clone()));
        chats.initialize_global_chat().await.unwrap();

        let sent = GLOBAL_MESSAGE_CAP + 3;
        for i in 0..sent {
            chats
                .send_global_message("ann", Some("Ann"), &format!("message {}", i))
                .await
                .unwrap();
        }

        let global = chats.global_chat().await.unwrap().unwrap();
        assert_eq!(global.messages.len(), GLOBAL_MESSAGE_CAP);
        // 환영 메시지 두 개와 가장 오래된 세 개가 밀려납니다
        assert_eq!(global.messages[0].text, "message 3");
        assert_eq!(global.messages.last().unwrap().text, format!("message {}", sent - 1));
        assert_eq!(global.total_messages, (sent + 2) as u64);
    }
}
