//! # 시계(Clock) 추상화
//!
//! 날짜 경계 리셋(만보기), 방해 금지 시간(알림), 인증 코드 만료처럼
//! "지금 몇 시인가"에 의존하는 로직을 테스트할 수 있도록 시간을 주입합니다.
//!
//! - `SystemClock`: 실제 로컬 시간
//! - `ManualClock`: 테스트에서 원하는 시각으로 고정/이동할 수 있는 시계

use chrono::{DateTime, Duration, FixedOffset, Local, Utc};
use std::sync::{Arc, Mutex};

/// 현재 시각을 제공하는 트레이트
///
/// `Send + Sync`: 여러 비동기 태스크에서 `Arc<dyn Clock>`으로 공유하기 위해 필요합니다.
pub trait Clock: Send + Sync {
    /// 현재 시각 (오프셋 포함). 달력 날짜 비교는 이 오프셋 기준입니다.
    fn now(&self) -> DateTime<FixedOffset>;

    /// 유닉스 에포크 기준 밀리초
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// 수동으로 조작하는 시계. 복제본끼리 같은 시각을 공유합니다.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<FixedOffset>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<FixedOffset>) {
        let mut guard = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *guard = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shares_time_between_clones() {
        let start = DateTime::parse_from_rfc3339("2024-03-10T12:00:00+00:00").unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance(Duration::minutes(5));
        assert_eq!(other.now(), start + Duration::minutes(5));
        assert_eq!(other.now_millis(), start.timestamp_millis() + 300_000);
    }
}
