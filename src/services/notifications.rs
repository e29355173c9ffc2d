//! # 알림 센터
//!
//! 알림을 "보내도 되는지" 판단하고, 보낸 알림을 기록합니다.
//! 실제 표시(브라우저 Notification API, 진동)는 호스트의 몫입니다.
//!
//! 발송 조건 (`can_send`):
//! 1. 권한이 `granted`
//! 2. 설정에서 알림이 켜져 있음
//! 3. 방해 금지 시간 밖
//! 4. 최근 1분 발송 수가 `maxPerMinute` 미만
//! 5. 해당 카테고리가 켜져 있음

use crate::clock::SharedClock;
use crate::db::collection::{keep_last, Collection, StoreOptions};
use crate::db::kv::KvStore;
use crate::error::AppError;
use crate::models::notification::*;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const SETTINGS_KEY: &str = "meetup_notifications_v2";
pub const PERMISSION_HISTORY_KEY: &str = "meetup_notifications_permission_history";
pub const SENT_KEY: &str = "meetup_sent_notifications";
pub const LEGACY_SETTINGS_KEY: &str = "meetup_notifications";

const PERMISSION_HISTORY_LIMIT: usize = 50;
const SENT_HISTORY_LIMIT: usize = 100;
const RATE_WINDOW_MS: i64 = 60_000;
const DEFAULT_TAG: &str = "meetup-general";
const DEFAULT_ICON: &str = "meetup-logo.png";

pub struct NotificationCenter {
    settings: Collection<NotificationSettings>,
    history: Collection<Vec<PermissionEvent>>,
    sent: Collection<Vec<NotificationRecord>>,
    clock: SharedClock,
    permission: Permission,
    window_started_at: i64,
    sent_in_window: u64,
}

impl NotificationCenter {
    /// 설정 슬롯이 없으면 예전 `meetup_notifications`("true"/"false")에서 옮겨 옵니다.
    pub async fn open(kv: KvStore, options: StoreOptions, clock: SharedClock) -> Result<Self, AppError> {
        let center = Self {
            settings: Collection::new(kv.clone(), SETTINGS_KEY, options),
            history: Collection::new(kv.clone(), PERMISSION_HISTORY_KEY, options),
            sent: Collection::new(kv.clone(), SENT_KEY, options),
            window_started_at: clock.now_millis(),
            clock,
            permission: Permission::default(),
            sent_in_window: 0,
        };

        if !center.settings.exists().await? {
            if let Some(old) = kv.get(LEGACY_SETTINGS_KEY).await? {
                let settings = NotificationSettings {
                    enabled: old.trim() == "true",
                    ..NotificationSettings::default()
                };
                center.settings.save(settings).await?;
                tracing::info!("Legacy notification setting migrated");
            }
        }
        Ok(center)
    }

    pub async fn settings(&self) -> Result<NotificationSettings, AppError> {
        self.settings.load().await
    }

    pub async fn save_settings(&self, patch: SettingsPatch) -> Result<NotificationSettings, AppError> {
        self.settings
            .mutate(|settings| {
                *settings = settings.clone().merge(patch);
                Ok(settings.clone())
            })
            .await
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// 호스트가 알려준 권한 상태를 반영하고 기록합니다 (최근 50개).
    pub async fn set_permission(&mut self, permission: Permission, reason: Option<&str>) -> Result<(), AppError> {
        self.permission = permission;
        let event = PermissionEvent {
            timestamp: self.clock.now_millis(),
            status: permission.as_str().to_string(),
            reason: reason.map(str::to_string),
        };
        self.history
            .mutate(|history| {
                history.push(event);
                keep_last(history, PERMISSION_HISTORY_LIMIT);
                Ok(())
            })
            .await?;
        tracing::debug!(permission = permission.as_str(), "Notification permission updated");
        Ok(())
    }

    pub async fn permission_history(&self) -> Result<Vec<PermissionEvent>, AppError> {
        self.history.load().await
    }

    pub async fn is_category_enabled(&self, category: NotificationCategory) -> Result<bool, AppError> {
        Ok(self.settings.load().await?.is_category_enabled(category))
    }

    pub async fn can_send(&mut self, category: NotificationCategory) -> Result<bool, AppError> {
        let settings = self.settings.load().await?;
        let now = self.clock.now();

        if self.permission != Permission::Granted || !settings.enabled {
            return Ok(false);
        }
        if settings.quiet_hours.contains(now.hour() * 60 + now.minute()) {
            return Ok(false);
        }
        // 지난 창의 카운터 초기화도 여기서 일어납니다
        if self.rate_limited(settings.max_per_minute) {
            return Ok(false);
        }
        Ok(settings.is_category_enabled(category))
    }

    /// 1분 창: 창이 시작된 지 60초가 넘으면 카운터를 0으로 되돌립니다.
    /// 고정 창이라서 창 경계 양쪽에 몰리면 1분 안에 한도의 두 배까지 나갈 수 있습니다.
    fn rate_limited(&mut self, max_per_minute: u64) -> bool {
        let now = self.clock.now_millis();
        if now.saturating_sub(self.window_started_at) > RATE_WINDOW_MS {
            self.sent_in_window = 0;
            self.window_started_at = now;
        }
        self.sent_in_window >= max_per_minute
    }

    /// 보낼 수 없으면 `None`. 보낸 알림은 발송 기록(최근 100개)에 남습니다.
    pub async fn notify(&mut self, request: NotificationRequest) -> Result<Option<NotificationRecord>, AppError> {
        if !self.can_send(request.category).await? {
            tracing::debug!(title = %request.title, "Notification suppressed");
            return Ok(None);
        }
        let settings = self.settings.load().await?;

        let record = NotificationRecord {
            id: format!("notif_{}", uuid::Uuid::now_v7()),
            title: request.title,
            body: request.body,
            kind: request.kind,
            category: request.category,
            tag: request.tag.unwrap_or_else(|| DEFAULT_TAG.to_string()),
            icon: Some(request.icon.unwrap_or_else(|| DEFAULT_ICON.to_string())),
            timestamp: self.clock.now_millis(),
            silent: !settings.sound,
            vibrate: if settings.vibration { VIBRATE_PATTERN.to_vec() } else { Vec::new() },
            require_interaction: request.require_interaction,
            actions: request.actions,
            delivered: true,
            data: request.data,
            ..NotificationRecord::default()
        };

        let record = self
            .sent
            .mutate(|sent| {
                sent.push(record);
                keep_last(sent, SENT_HISTORY_LIMIT);
                Ok(sent.last().cloned().unwrap_or_default())
            })
            .await?;
        // 기록에 실패한 알림은 발송 수에 넣지 않습니다
        self.sent_in_window += 1;

        tracing::debug!(id = %record.id, kind = ?record.kind, "Notification sent");
        Ok(Some(record))
    }

    /// 표시/클릭/닫힘을 기록합니다. 기록에 없는 id면 `false`.
    pub async fn record_interaction(&self, id: &str, interaction: Interaction) -> Result<bool, AppError> {
        self.sent
            .mutate(|sent| {
                let Some(record) = sent.iter_mut().find(|r| r.id == id) else {
                    return Ok(false);
                };
                match interaction {
                    Interaction::Shown => record.shown = true,
                    Interaction::Clicked => {
                        record.clicked = true;
                        record.interacted = true;
                    }
                    Interaction::Closed => record.closed = true,
                }
                Ok(true)
            })
            .await
    }

    pub async fn sent_notifications(&self) -> Result<Vec<NotificationRecord>, AppError> {
        self.sent.load().await
    }

    // ===== 용도별 알림 =====

    pub async fn nearby_friend(
        &mut self,
        friend_name: &str,
        distance_km: f64,
        friend_id: Option<&str>,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.notify(NotificationRequest {
            title: "👋 Friend nearby!".to_string(),
            body: format!("{} is {:.1} km away from you", friend_name, distance_km),
            kind: NotificationKind::NearbyFriend,
            category: NotificationCategory::Location,
            tag: Some("nearby-friend".to_string()),
            icon: Some("friend-nearby-icon.png".to_string()),
            data: json!({
                "friendId": friend_id,
                "distance": distance_km,
                "actionUrl": format!("/friend/{}", friend_id.unwrap_or_default()),
            }),
            actions: vec![
                action("message", "Message", "message-icon.png"),
                action("profile", "Profile", "profile-icon.png"),
            ],
            ..NotificationRequest::default()
        })
        .await
    }

    pub async fn friend_request(
        &mut self,
        from_id: &str,
        from_nickname: &str,
        from_avatar: Option<&str>,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.notify(NotificationRequest {
            title: "🆕 New friend request".to_string(),
            body: format!("{} wants to add you as a friend", from_nickname),
            kind: NotificationKind::FriendRequest,
            category: NotificationCategory::Social,
            tag: Some("friend-request".to_string()),
            icon: Some(from_avatar.unwrap_or("default-avatar.png").to_string()),
            require_interaction: true,
            data: json!({ "userId": from_id, "actionUrl": "/friends/requests" }),
            actions: vec![
                action("accept", "Accept", "accept-icon.png"),
                action("decline", "Decline", "decline-icon.png"),
            ],
        })
        .await
    }

    pub async fn new_message(
        &mut self,
        sender_name: &str,
        preview: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.notify(NotificationRequest {
            title: format!("💬 {}", sender_name),
            body: truncate_preview(preview),
            kind: NotificationKind::NewMessage,
            category: NotificationCategory::Messages,
            tag: Some(format!("chat-{}", chat_id)),
            icon: Some("message-icon.png".to_string()),
            data: json!({
                "chatId": chat_id,
                "messageId": message_id,
                "actionUrl": format!("/chat/{}", chat_id),
            }),
            ..NotificationRequest::default()
        })
        .await
    }

    /// `starts_at`(epoch ms)을 시계의 오프셋 기준 `HH:MM`으로 보여줍니다.
    pub async fn event_reminder(
        &mut self,
        event_title: &str,
        starts_at: i64,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let offset = *self.clock.now().offset();
        let time = DateTime::<Utc>::from_timestamp_millis(starts_at)
            .ok_or_else(|| AppError::InvalidInput(format!("Invalid event time {}", starts_at)))?
            .with_timezone(&offset)
            .format("%H:%M")
            .to_string();

        self.notify(NotificationRequest {
            title: "⏰ Meetup reminder".to_string(),
            body: format!("{} starts at {}", event_title, time),
            kind: NotificationKind::EventReminder,
            category: NotificationCategory::Events,
            tag: Some(format!("event-reminder-{}", event_id)),
            icon: Some("event-icon.png".to_string()),
            data: json!({ "eventId": event_id, "actionUrl": format!("/event/{}", event_id) }),
            ..NotificationRequest::default()
        })
        .await
    }

    pub async fn send_test(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        let now = self.clock.now_millis();
        self.notify(NotificationRequest {
            title: "MeetUP test notification".to_string(),
            body: "This is a test notification. Everything works! 🚀".to_string(),
            kind: NotificationKind::System,
            category: NotificationCategory::System,
            icon: Some(DEFAULT_ICON.to_string()),
            data: json!({ "test": true, "timestamp": now }),
            ..NotificationRequest::default()
        })
        .await
    }

    // ===== 통계, 정리 =====

    pub async fn stats(&self) -> Result<NotificationStats, AppError> {
        let sent = self.sent.load().await?;
        let history = self.history.load().await?;

        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        for record in &sent {
            *by_type.entry(kind_name(record.kind)).or_default() += 1;
            *by_category.entry(record.category.as_str().to_string()).or_default() += 1;
        }

        // 발송 기록은 최근 100개뿐이라 통계도 그 범위 안의 값입니다
        let total_sent = sent.len() as u64;
        let total_clicked = sent.iter().filter(|r| r.clicked).count() as u64;
        let click_rate = if total_sent > 0 {
            (total_clicked as f64 / total_sent as f64 * 100.0).round()
        } else {
            0.0
        };

        Ok(NotificationStats {
            total_sent,
            total_clicked,
            total_delivered: sent.iter().filter(|r| r.delivered).count() as u64,
            by_type,
            by_category,
            click_rate,
            permission_history: history.len() as u64,
        })
    }

    /// `days`일보다 오래된 발송 기록을 지우고, 지운 개수를 반환합니다.
    pub async fn clear_old(&self, days: u32) -> Result<usize, AppError> {
        // 표현할 수 없을 만큼 먼 과거면 그보다 오래된 기록도 없습니다
        let Some(cutoff) = Duration::try_days(i64::from(days))
            .and_then(|age| self.clock.now_utc().checked_sub_signed(age))
            .map(|at| at.timestamp_millis())
        else {
            return Ok(0);
        };
        let removed = self
            .sent
            .mutate(|sent| {
                let before = sent.len();
                sent.retain(|r| r.timestamp > cutoff);
                Ok(before - sent.len())
            })
            .await?;

        if removed > 0 {
            tracing::info!(removed, days, "Old notifications cleared");
        }
        Ok(removed)
    }

    pub fn clear_cache(&self) {
        self.settings.clear_cache();
        self.history.clear_cache();
        self.sent.clear_cache();
    }
}

fn action(action: &str, title: &str, icon: &str) -> NotificationAction {
    NotificationAction {
        action: action.to_string(),
        title: title.to_string(),
        icon: Some(icon.to_string()),
    }
}

/// 50자를 넘으면 47자 + "..."
fn truncate_preview(text: &str) -> String {
    if text.chars().count() > 50 {
        format!("{}...", text.chars().take(47).collect::<String>())
    } else {
        text.to_string()
    }
}

fn kind_name(kind: NotificationKind) -> String {
    match serde_json::to_value(kind) {
        Ok(Value::String(name)) => name,
        _ => "system".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::connect_in_memory;
    use std::sync::Arc;

    async fn center_at(at: &str) -> (NotificationCenter, ManualClock, KvStore) {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339(at).unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        let center = NotificationCenter::open(kv.clone(), StoreOptions::default(), Arc::new(clock.clone()))
            .await
            .unwrap();
        (center, clock, kv)
    }

    async fn granted(at: &str) -> (NotificationCenter, ManualClock) {
        let (mut center, clock, _) = center_at(at).await;
        center.set_permission(Permission::Granted, None).await.unwrap();
        (center, clock)
    }

    #[tokio::test]
    async fn test_nothing_is_sent_without_permission() {
        let (mut center, _, _) = center_at("2024-05-01T12:00:00+03:00").await;
        assert!(center.send_test().await.unwrap().is_none());

        center.set_permission(Permission::Denied, Some("user blocked")).await.unwrap();
        assert!(center.send_test().await.unwrap().is_none());
        assert!(center.sent_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quiet_hours_wrap_midnight() {
        let (mut center, clock) = granted("2024-05-01T23:30:00+03:00").await;
        center
            .save_settings(SettingsPatch {
                quiet_hours: Some(QuietHours { enabled: true, ..QuietHours::default() }),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();

        assert!(!center.can_send(NotificationCategory::System).await.unwrap());
        clock.set(chrono::DateTime::parse_from_rfc3339("2024-05-02T07:59:00+03:00").unwrap());
        assert!(!center.can_send(NotificationCategory::System).await.unwrap());
        clock.set(chrono::DateTime::parse_from_rfc3339("2024-05-02T08:00:00+03:00").unwrap());
        assert!(center.can_send(NotificationCategory::System).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_holds_within_a_minute() {
        let (mut center, clock) = granted("2024-05-01T12:00:00+03:00").await;

        for _ in 0..5 {
            assert!(center.send_test().await.unwrap().is_some());
        }
        assert!(center.send_test().await.unwrap().is_none());

        clock.advance(Duration::seconds(61));
        assert!(center.send_test().await.unwrap().is_some());
        assert_eq!(center.sent_notifications().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_location_category_is_off_by_default() {
        let (mut center, _) = granted("2024-05-01T12:00:00+03:00").await;
        assert!(!center.is_category_enabled(NotificationCategory::Location).await.unwrap());
        assert!(center.nearby_friend("Ann", 0.42, Some("u1")).await.unwrap().is_none());

        center
            .save_settings(SettingsPatch {
                categories: Some(BTreeMap::from([("location".to_string(), true)])),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();
        let record = center.nearby_friend("Ann", 0.42, Some("u1")).await.unwrap().unwrap();
        assert_eq!(record.body, "Ann is 0.4 km away from you");
        assert_eq!(record.data["friendId"], "u1");
    }

    #[tokio::test]
    async fn test_builders() {
        let (mut center, _) = granted("2024-05-01T12:00:00+03:00").await;

        let long = "a".repeat(60);
        let message = center.new_message("Bob", &long, "chat_1", "msg_1").await.unwrap().unwrap();
        assert_eq!(message.body, format!("{}...", "a".repeat(47)));
        assert_eq!(message.tag, "chat-chat_1");
        assert_eq!(message.vibrate, VIBRATE_PATTERN.to_vec());
        assert!(!message.silent);

        let exact = "b".repeat(50);
        let message = center.new_message("Bob", &exact, "chat_1", "msg_2").await.unwrap().unwrap();
        assert_eq!(message.body, exact);

        // 2024-05-01T15:05:00Z = 18:05 (+03:00)
        let starts_at = chrono::DateTime::parse_from_rfc3339("2024-05-01T15:05:00Z").unwrap().timestamp_millis();
        let reminder = center.event_reminder("Picnic", starts_at, "ev1").await.unwrap().unwrap();
        assert_eq!(reminder.body, "Picnic starts at 18:05");

        let request = center.friend_request("u2", "Carol", None).await.unwrap().unwrap();
        assert!(request.require_interaction);
        assert_eq!(request.icon.as_deref(), Some("default-avatar.png"));
        assert_eq!(request.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_sound_and_vibration_settings_shape_records() {
        let (mut center, _) = granted("2024-05-01T12:00:00+03:00").await;
        center
            .save_settings(SettingsPatch {
                sound: Some(false),
                vibration: Some(false),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();

        let record = center.send_test().await.unwrap().unwrap();
        assert!(record.silent);
        assert!(record.vibrate.is_empty());
    }

    #[tokio::test]
    async fn test_interactions_and_stats() {
        let (mut center, _) = granted("2024-05-01T12:00:00+03:00").await;
        let first = center.send_test().await.unwrap().unwrap();
        center.new_message("Bob", "hi", "c1", "m1").await.unwrap().unwrap();
        center.new_message("Bob", "hey", "c1", "m2").await.unwrap().unwrap();

        assert!(center.record_interaction(&first.id, Interaction::Clicked).await.unwrap());
        assert!(!center.record_interaction("missing", Interaction::Shown).await.unwrap());

        let stats = center.stats().await.unwrap();
        assert_eq!(stats.total_sent, 3);
        assert_eq!(stats.total_clicked, 1);
        assert_eq!(stats.total_delivered, 3);
        assert_eq!(stats.by_type.get("new_message"), Some(&2));
        assert_eq!(stats.by_category.get("system"), Some(&1));
        assert_eq!(stats.click_rate, 33.0);
        assert_eq!(stats.permission_history, 1);
    }

    #[tokio::test]
    async fn test_clear_old() {
        let (mut center, clock) = granted("2024-05-01T12:00:00+03:00").await;
        center.send_test().await.unwrap().unwrap();
        clock.advance(Duration::days(20));
        center.send_test().await.unwrap().unwrap();
        clock.advance(Duration::days(15));

        assert_eq!(center.clear_old(30).await.unwrap(), 1);
        assert_eq!(center.clear_old(30).await.unwrap(), 0);
        assert_eq!(center.sent_notifications().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_old_accepts_any_age() {
        let (mut center, _) = granted("2024-05-01T12:00:00+03:00").await;
        center.send_test().await.unwrap().unwrap();

        assert_eq!(center.clear_old(u32::MAX).await.unwrap(), 0);
        assert_eq!(center.clear_old(0).await.unwrap(), 0);
        assert_eq!(center.sent_notifications().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_use_rate_budget() {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00+03:00").unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap()).with_quota(Some(16));
        let mut center = NotificationCenter::open(kv, StoreOptions::default(), Arc::new(clock))
            .await
            .unwrap();
        center.permission = Permission::Granted;

        for _ in 0..10 {
            assert!(matches!(center.send_test().await, Err(AppError::StorageUnavailable(_))));
        }
        assert_eq!(center.sent_in_window, 0);
        assert!(center.can_send(NotificationCategory::System).await.unwrap());
    }

    #[tokio::test]
    async fn test_permission_history_is_bounded() {
        let (mut center, _, _) = center_at("2024-05-01T12:00:00+03:00").await;
        for _ in 0..60 {
            center.set_permission(Permission::Prompt, None).await.unwrap();
        }
        let history = center.permission_history().await.unwrap();
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].status, "default");
    }

    #[tokio::test]
    async fn test_legacy_flag_is_migrated() {
        let clock = ManualClock::new(chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00+03:00").unwrap());
        let kv = KvStore::new(connect_in_memory().await.unwrap());
        kv.put(LEGACY_SETTINGS_KEY, "false").await.unwrap();

        let center = NotificationCenter::open(kv, StoreOptions::default(), Arc::new(clock)).await.unwrap();
        let settings = center.settings().await.unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.max_per_minute, 5);
    }
}
