//! # 만보기 서비스
//!
//! 걸음 감지기(`StepDetector`)에서 나온 걸음을 모아 `meetup_pedometer_stats`에 누적합니다.
//!
//! ## 흐름
//! 1. `on_motion`: 추적 중일 때만 샘플을 감지기에 넘깁니다.
//! 2. 감지된 걸음은 `pending`에 쌓이고, `batch_size`(기본 10)개가 되면 한 번에 저장됩니다.
//! 3. `stop_tracking`은 남은 걸음을 저장합니다.
//!
//! ## 기간 리셋(rollover)
//! 읽을 때마다 `rolled_over`를 적용하고(저장하지 않음), 쓰기 전에도 적용합니다.
//! - today: `last_update`와 달력 날짜가 다르면 0
//! - week: `last_update`가 7일보다 오래되면 0
//! - month: `last_update`가 한 달(달력 기준)보다 오래되면 0

use crate::clock::SharedClock;
use crate::db::collection::{Collection, StoreOptions};
use crate::db::kv::KvStore;
use crate::db::lenient;
use crate::error::AppError;
use crate::models::pedometer::*;
use crate::services::step_detector::{DetectorConfig, StepDetector};
use chrono::{DateTime, Duration, FixedOffset, Months, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const STATS_KEY: &str = "meetup_pedometer_stats";

#[derive(Debug, Clone, Copy)]
pub struct PedometerConfig {
    pub detector: DetectorConfig,
    pub batch_size: u64,
    pub default_goal: u64,
    /// 모션 센서가 있는 환경인지 (없으면 수동 입력만 가능)
    pub motion_available: bool,
}

impl Default for PedometerConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            batch_size: 10,
            default_goal: DEFAULT_GOAL,
            motion_available: true,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedStats {
    #[serde(flatten)]
    snapshot: StatsSnapshot,
    export_date: DateTime<FixedOffset>,
}

pub struct Pedometer {
    stats: Collection<PedometerStats>,
    clock: SharedClock,
    config: PedometerConfig,
    detector: StepDetector,
    pending: u64,
    tracking: bool,
    events: broadcast::Sender<PedometerEvent>,
}

impl Pedometer {
    /// 저장된 통계가 없으면 설정된 기본 목표로 새 통계를 만듭니다.
    pub async fn open(
        kv: KvStore,
        options: StoreOptions,
        clock: SharedClock,
        config: PedometerConfig,
    ) -> Result<Self, AppError> {
        let stats = Collection::new(kv, STATS_KEY, options);
        if !stats.exists().await? {
            stats
                .save(PedometerStats {
                    goal: config.default_goal,
                    ..PedometerStats::default()
                })
                .await?;
        }

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            stats,
            clock,
            detector: StepDetector::new(config.detector),
            config,
            pending: 0,
            tracking: false,
            events,
        })
    }

    /// 통계 변경 이벤트 구독
    pub fn subscribe(&self) -> broadcast::Receiver<PedometerEvent> {
        self.events.subscribe()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// 감지되었지만 아직 저장되지 않은 걸음 수
    pub fn pending_steps(&self) -> u64 {
        self.pending
    }

    /// 모션 센서가 없으면 `false`를 반환하고 아무 일도 하지 않습니다.
    pub fn start_tracking(&mut self) -> bool {
        if !self.config.motion_available {
            tracing::warn!("Motion sensor unavailable, step tracking not started");
            return false;
        }
        if !self.tracking {
            self.detector.reset();
            self.tracking = true;
            tracing::info!("Step tracking started");
        }
        true
    }

    /// 추적을 멈추고 남은 걸음을 저장합니다.
    pub async fn stop_tracking(&mut self) -> Result<StatsSnapshot, AppError> {
        if self.tracking {
            self.tracking = false;
            self.detector.reset();
            tracing::info!(pending = self.pending, "Step tracking stopped");
        }
        self.flush().await?;
        self.get_stats().await
    }

    /// 센서 샘플 하나. 걸음이 감지되면 `true`.
    pub async fn on_motion(&mut self, sample: MotionSample) -> Result<bool, AppError> {
        if !self.tracking || !self.detector.push(&sample) {
            return Ok(false);
        }

        self.pending += 1;
        if self.pending >= self.config.batch_size.max(1) {
            self.flush().await?;
        }
        Ok(true)
    }

    pub async fn add_steps_manually(&mut self, steps: u64) -> Result<StatsSnapshot, AppError> {
        if steps == 0 {
            return Err(AppError::InvalidInput("Step count must be positive".to_string()));
        }
        self.add_steps(steps).await
    }

    /// `min..=max` 범위의 무작위 걸음을 추가합니다. 추가한 걸음 수를 반환합니다.
    pub async fn simulate_steps(&mut self, min: u64, max: u64) -> Result<u64, AppError> {
        if min == 0 || min > max {
            return Err(AppError::InvalidInput(format!(
                "Invalid step range {}..={}",
                min, max
            )));
        }
        let steps = rand::thread_rng().gen_range(min..=max);
        self.add_steps(steps).await?;
        Ok(steps)
    }

    /// 기간 리셋을 반영한 통계. 저장하지 않으므로 몇 번을 불러도 결과가 같습니다.
    pub async fn get_stats(&self) -> Result<StatsSnapshot, AppError> {
        let stats = rolled_over(&self.stats.load().await?, self.clock.now());
        Ok(StatsSnapshot::from_stats(&stats, self.tracking))
    }

    pub async fn reset_stats(&mut self, scope: ResetScope) -> Result<StatsSnapshot, AppError> {
        let now = self.clock.now();
        self.stats
            .mutate(|stats| {
                *stats = rolled_over(stats, now);
                match scope {
                    ResetScope::Today => stats.today = 0,
                    ResetScope::Week => stats.week = 0,
                    ResetScope::Month => stats.month = 0,
                    ResetScope::All => {
                        // 목표는 유지
                        stats.today = 0;
                        stats.week = 0;
                        stats.month = 0;
                        stats.total_distance = 0.0;
                    }
                }
                stats.last_update = now.timestamp_millis();
                Ok(())
            })
            .await?;

        tracing::info!(?scope, "Pedometer stats reset");
        let _ = self.events.send(PedometerEvent::Reset(scope));
        self.get_stats().await
    }

    pub async fn set_goal(&mut self, goal: i64) -> Result<StatsSnapshot, AppError> {
        if goal <= 0 {
            return Err(AppError::InvalidInput("Goal must be a positive number of steps".to_string()));
        }
        let goal = goal as u64;
        let now = self.clock.now();
        self.stats
            .mutate(|stats| {
                *stats = rolled_over(stats, now);
                stats.goal = goal;
                stats.last_update = now.timestamp_millis();
                Ok(())
            })
            .await?;

        let _ = self.events.send(PedometerEvent::GoalChanged(goal));
        self.get_stats().await
    }

    pub async fn is_goal_achieved(&self) -> Result<bool, AppError> {
        let snapshot = self.get_stats().await?;
        Ok(snapshot.today >= snapshot.goal)
    }

    pub async fn remaining_steps(&self) -> Result<u64, AppError> {
        let snapshot = self.get_stats().await?;
        Ok(snapshot.goal.saturating_sub(snapshot.today))
    }

    pub async fn export_stats(&self) -> Result<String, AppError> {
        let exported = ExportedStats {
            snapshot: self.get_stats().await?,
            export_date: self.clock.now(),
        };
        serde_json::to_string_pretty(&exported)
            .map_err(|e| AppError::Internal(format!("Failed to export stats: {}", e)))
    }

    /// 내보낸 JSON(또는 그 일부)을 현재 통계 위에 덮어씁니다.
    pub async fn import_stats(&mut self, json: &str) -> Result<StatsSnapshot, AppError> {
        let incoming: Value = serde_json::from_str(json)
            .map_err(|e| AppError::InvalidInput(format!("Malformed stats JSON: {}", e)))?;
        let Value::Object(incoming) = incoming else {
            return Err(AppError::InvalidInput("Stats must be a JSON object".to_string()));
        };

        self.stats
            .mutate(|stats| {
                let mut merged = serde_json::to_value(&*stats)
                    .map_err(|e| AppError::Internal(format!("Failed to serialize stats: {}", e)))?;
                if let Value::Object(fields) = &mut merged {
                    fields.extend(incoming);
                }
                *stats = lenient::document(merged);
                Ok(())
            })
            .await?;

        tracing::info!("Pedometer stats imported");
        let snapshot = self.get_stats().await?;
        let _ = self.events.send(PedometerEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn clear_cache(&self) {
        self.stats.clear_cache();
    }

    async fn flush(&mut self) -> Result<(), AppError> {
        if self.pending == 0 {
            return Ok(());
        }
        let steps = self.pending;
        self.add_steps(steps).await?;
        self.pending = 0;
        Ok(())
    }

    async fn add_steps(&mut self, steps: u64) -> Result<StatsSnapshot, AppError> {
        let now = self.clock.now();
        self.stats
            .mutate(|stats| {
                *stats = rolled_over(stats, now);
                // 상한은 저장 시 정규화에서 적용됩니다
                stats.today = stats.today.saturating_add(steps);
                stats.week = stats.week.saturating_add(steps);
                stats.month = stats.month.saturating_add(steps);
                stats.total_distance += steps as f64 * STEP_LENGTH_KM;
                stats.last_update = now.timestamp_millis();
                Ok(())
            })
            .await?;

        tracing::debug!(steps, "Steps recorded");
        let snapshot = self.get_stats().await?;
        let _ = self.events.send(PedometerEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }
}

/// 기간 경계를 넘은 카운터를 0으로 만든 사본을 반환합니다.
pub fn rolled_over(stats: &PedometerStats, now: DateTime<FixedOffset>) -> PedometerStats {
    let mut rolled = stats.clone();
    let Some(last) = DateTime::<Utc>::from_timestamp_millis(stats.last_update).filter(|_| stats.last_update > 0) else {
        return rolled;
    };
    let last = last.with_timezone(now.offset());

    if last.date_naive() != now.date_naive() {
        rolled.today = 0;
    }
    if now.signed_duration_since(last) > Duration::days(7) {
        rolled.week = 0;
    }
    if now
        .checked_sub_months(Months::new(1))
        .is_some_and(|month_ago| last < month_ago)
    {
        rolled.month = 0;
    }
    rolled
}
