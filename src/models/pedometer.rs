//! # 만보기 모델 정의
//!
//! - `MotionSample`: 가속도 센서 샘플 한 개 (저장하지 않음)
//! - `PedometerStats`: `meetup_pedometer_stats` 슬롯에 저장되는 누적 통계
//! - `StatsSnapshot`: 화면에 보여줄 계산된 통계 (칼로리, 목표 달성률 등)

use crate::db::collection::{single_document, Document};
use crate::db::lenient;
use serde::{Deserialize, Serialize};

/// 한 걸음의 길이 (km). 0.76m
pub const STEP_LENGTH_KM: f64 = 0.00076;
pub const CALORIES_PER_STEP: f64 = 0.04;
pub const DEFAULT_GOAL: u64 = 10_000;
/// 카운터 상한. JSON 숫자(f64)로 정확히 표현되는 가장 큰 정수입니다.
pub const MAX_STEP_COUNT: u64 = 9_007_199_254_740_991;

/// 가속도 센서 샘플. `timestamp`는 단조 증가하는 밀리초입니다.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: i64,
}

impl MotionSample {
    /// 가속도 벡터의 크기 `sqrt(x² + y² + z²)`
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// 저장되는 걸음 통계
///
/// `today`/`week`/`month`는 각자의 기간이 끝나면 0으로 돌아가고,
/// `total_distance`는 절대 줄어들지 않습니다 (명시적 리셋 제외).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PedometerStats {
    #[serde(deserialize_with = "lenient::count")]
    pub today: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub week: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub month: u64,
    /// km
    #[serde(deserialize_with = "lenient::decimal")]
    pub total_distance: f64,
    #[serde(deserialize_with = "lenient::count")]
    pub goal: u64,
    /// 마지막 저장 시각 (epoch ms)
    #[serde(deserialize_with = "lenient::millis")]
    pub last_update: i64,
}

impl Default for PedometerStats {
    fn default() -> Self {
        Self {
            today: 0,
            week: 0,
            month: 0,
            total_distance: 0.0,
            goal: DEFAULT_GOAL,
            last_update: 0,
        }
    }
}

impl Document for PedometerStats {
    fn normalized(mut self) -> Self {
        self.today = self.today.min(MAX_STEP_COUNT);
        self.week = self.week.min(MAX_STEP_COUNT);
        self.month = self.month.min(MAX_STEP_COUNT);
        if !self.total_distance.is_finite() || self.total_distance < 0.0 {
            self.total_distance = 0.0;
        }
        if self.goal == 0 {
            self.goal = DEFAULT_GOAL;
        }
        self
    }
}

single_document!(PedometerStats);

/// 계산된 통계 (읽기 전용 뷰)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub today: u64,
    pub week: u64,
    pub month: u64,
    pub total_distance: f64,
    pub goal: u64,
    pub last_update: i64,
    pub calories: u64,
    pub distance_today: f64,
    /// 0.0 ~ 100.0, 소수 첫째 자리까지
    pub goal_progress: f64,
    pub is_tracking: bool,
}

impl StatsSnapshot {
    pub fn from_stats(stats: &PedometerStats, is_tracking: bool) -> Self {
        let goal_progress = if stats.goal > 0 {
            (stats.today as f64 / stats.goal as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Self {
            today: stats.today,
            week: stats.week,
            month: stats.month,
            total_distance: stats.total_distance,
            goal: stats.goal,
            last_update: stats.last_update,
            calories: (stats.today as f64 * CALORIES_PER_STEP).round() as u64,
            distance_today: stats.today as f64 * STEP_LENGTH_KM,
            goal_progress: (goal_progress * 10.0).round() / 10.0,
            is_tracking,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetScope {
    Today,
    Week,
    Month,
    All,
}

/// 통계가 바뀔 때 구독자에게 전달되는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum PedometerEvent {
    Updated(StatsSnapshot),
    Reset(ResetScope),
    GoalChanged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_oversized_counters_are_clamped() {
        let stats: PedometerStats = lenient::document(json!({
            "today": 18446744073709551615u64,
            "week": 1e30,
            "month": 12
        }));
        let stats = stats.normalized();

        assert_eq!(stats.today, MAX_STEP_COUNT);
        assert_eq!(stats.week, MAX_STEP_COUNT);
        assert_eq!(stats.month, 12);
    }

    #[test]
    fn test_snapshot_derivations() {
        let stats = PedometerStats {
            today: 2_513,
            goal: 10_000,
            ..PedometerStats::default()
        };
        let snapshot = StatsSnapshot::from_stats(&stats, false);

        assert_eq!(snapshot.calories, 101);
        assert_eq!(snapshot.goal_progress, 25.1);
        assert!((snapshot.distance_today - 1.90988).abs() < 1e-9);
    }

    #[test]
    fn test_goal_progress_is_capped() {
        let stats = PedometerStats {
            today: 30_000,
            ..PedometerStats::default()
        };
        assert_eq!(StatsSnapshot::from_stats(&stats, true).goal_progress, 100.0);
    }

    #[test]
    fn test_corrupt_fields_normalize() {
        let stats: PedometerStats = lenient::document(json!({
            "today": "abc",
            "week": 40,
            "totalDistance": -2,
            "goal": 0
        }));
        let stats = stats.normalized();

        assert_eq!(stats.today, 0);
        assert_eq!(stats.week, 40);
        assert_eq!(stats.total_distance, 0.0);
        assert_eq!(stats.goal, DEFAULT_GOAL);
    }

    #[test]
    fn test_magnitude() {
        let sample = MotionSample { x: 3.0, y: 4.0, z: 12.0, timestamp: 0 };
        assert_eq!(sample.magnitude(), 13.0);
    }
}
