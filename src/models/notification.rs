//! # 알림 모델 정의
//!
//! 브라우저 Notification API 자체는 호스트(UI 계층)의 몫입니다.
//! 이 모듈은 "보내도 되는가"를 결정하는 설정과, 보낸 알림의 기록만 다룹니다.

use crate::db::collection::{single_document, Document};
use crate::db::lenient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_QUIET_START: &str = "23:00";
pub const DEFAULT_QUIET_END: &str = "08:00";
pub const VIBRATE_PATTERN: [u64; 3] = [200, 100, 200];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequest,
    NearbyFriend,
    NewMessage,
    EventReminder,
    #[default]
    System,
    MeetupInvite,
    FriendAccepted,
    MessageLike,
    EventUpdate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Social,
    Messages,
    Events,
    #[default]
    System,
    Location,
}

impl NotificationCategory {
    pub const ALL: [NotificationCategory; 5] = [
        NotificationCategory::Social,
        NotificationCategory::Messages,
        NotificationCategory::Events,
        NotificationCategory::System,
        NotificationCategory::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Social => "social",
            NotificationCategory::Messages => "messages",
            NotificationCategory::Events => "events",
            NotificationCategory::System => "system",
            NotificationCategory::Location => "location",
        }
    }

    /// 위치 알림만 기본적으로 꺼져 있습니다.
    pub fn enabled_by_default(&self) -> bool {
        !matches!(self, NotificationCategory::Location)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// 호스트가 알려주는 알림 권한 상태
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    #[serde(rename = "default")]
    Prompt,
    Granted,
    Denied,
    Unsupported,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Prompt => "default",
            Permission::Granted => "granted",
            Permission::Denied => "denied",
            Permission::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuietHours {
    #[serde(deserialize_with = "lenient::or_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub start: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: DEFAULT_QUIET_START.to_string(),
            end: DEFAULT_QUIET_END.to_string(),
        }
    }
}

impl QuietHours {
    /// 하루 중 분(minute) 단위 시각이 방해 금지 구간 안인지.
    /// 시작이 끝보다 늦으면 자정을 넘기는 구간입니다 (예: 23:00~08:00).
    pub fn contains(&self, minute_of_day: u32) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if start <= end {
            minute_of_day >= start && minute_of_day < end
        } else {
            minute_of_day >= start || minute_of_day < end
        }
    }

    fn normalized(mut self) -> Self {
        if parse_hhmm(&self.start).is_none() {
            self.start = DEFAULT_QUIET_START.to_string();
        }
        if parse_hhmm(&self.end).is_none() {
            self.end = DEFAULT_QUIET_END.to_string();
        }
        self
    }
}

/// "HH:MM" → 자정 이후 분. 형식이 틀리면 `None`.
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let (h, m) = value.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationSettings {
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub enabled: bool,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub sound: bool,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub vibration: bool,
    #[serde(deserialize_with = "lenient::flag_or_true")]
    pub popup: bool,
    #[serde(deserialize_with = "lenient::flag_map")]
    pub categories: BTreeMap<String, bool>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub quiet_hours: QuietHours,
    #[serde(deserialize_with = "lenient::or_default")]
    pub priority_level: PriorityLevel,
    #[serde(deserialize_with = "lenient::count")]
    pub display_duration: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub max_per_minute: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound: true,
            vibration: true,
            popup: true,
            categories: default_categories(),
            quiet_hours: QuietHours::default(),
            priority_level: PriorityLevel::default(),
            display_duration: 7000,
            max_per_minute: 5,
        }
    }
}

impl Document for NotificationSettings {
    fn normalized(mut self) -> Self {
        for (name, enabled) in default_categories() {
            self.categories.entry(name).or_insert(enabled);
        }
        self.quiet_hours = self.quiet_hours.normalized();
        if self.display_duration == 0 {
            self.display_duration = 7000;
        }
        self
    }
}

single_document!(NotificationSettings);

impl NotificationSettings {
    pub fn is_category_enabled(&self, category: NotificationCategory) -> bool {
        self.enabled && self.categories.get(category.as_str()).copied().unwrap_or(true)
    }

    /// 얕은 병합. `categories`는 키 단위로 병합합니다.
    pub fn merge(mut self, patch: SettingsPatch) -> Self {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.sound {
            self.sound = v;
        }
        if let Some(v) = patch.vibration {
            self.vibration = v;
        }
        if let Some(v) = patch.popup {
            self.popup = v;
        }
        if let Some(categories) = patch.categories {
            self.categories.extend(categories);
        }
        if let Some(v) = patch.quiet_hours {
            self.quiet_hours = v;
        }
        if let Some(v) = patch.priority_level {
            self.priority_level = v;
        }
        if let Some(v) = patch.display_duration {
            self.display_duration = v;
        }
        if let Some(v) = patch.max_per_minute {
            self.max_per_minute = v;
        }
        self.normalized()
    }
}

fn default_categories() -> BTreeMap<String, bool> {
    NotificationCategory::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), c.enabled_by_default()))
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub sound: Option<bool>,
    pub vibration: Option<bool>,
    pub popup: Option<bool>,
    pub categories: Option<BTreeMap<String, bool>>,
    pub quiet_hours: Option<QuietHours>,
    pub priority_level: Option<PriorityLevel>,
    pub display_duration: Option<u64>,
    pub max_per_minute: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionEvent {
    #[serde(deserialize_with = "lenient::millis")]
    pub timestamp: i64,
    /// requested | granted | denied | default | unsupported | error
    #[serde(deserialize_with = "lenient::or_default")]
    pub status: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub reason: Option<String>,
}

impl Document for PermissionEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// 알림 생성 요청
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub category: NotificationCategory,
    pub tag: Option<String>,
    pub icon: Option<String>,
    pub require_interaction: bool,
    pub data: Value,
    pub actions: Vec<NotificationAction>,
}

/// 보낸 알림 기록 (`meetup_sent_notifications`, 최근 100개)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(deserialize_with = "lenient::or_default")]
    pub id: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub title: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub body: String,
    #[serde(rename = "type", deserialize_with = "lenient::or_default")]
    pub kind: NotificationKind,
    #[serde(deserialize_with = "lenient::or_default")]
    pub category: NotificationCategory,
    #[serde(deserialize_with = "lenient::or_default")]
    pub tag: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub icon: Option<String>,
    #[serde(deserialize_with = "lenient::millis")]
    pub timestamp: i64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub silent: bool,
    #[serde(deserialize_with = "lenient::list")]
    pub vibrate: Vec<u64>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub require_interaction: bool,
    #[serde(deserialize_with = "lenient::list")]
    pub actions: Vec<NotificationAction>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub delivered: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub shown: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub clicked: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub closed: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub interacted: bool,
    pub data: Value,
}

impl Document for NotificationRecord {
    fn normalized(mut self) -> Self {
        if !self.data.is_object() {
            self.data = Value::Object(Default::default());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Shown,
    Clicked,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub total_sent: u64,
    pub total_clicked: u64,
    pub total_delivered: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
    /// 클릭률(%)
    pub click_rate: f64,
    pub permission_history: u64,
}
