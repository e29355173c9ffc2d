//! # 걸음 감지기
//!
//! 가속도 센서 샘플을 받아 걸음을 감지합니다. I/O가 없는 순수 신호 처리입니다.
//!
//! ```text
//! 샘플 → 크기 m = √(x²+y²+z²) → 이동 평균 s (창 크기 5) → delta = |s - s_prev|
//!      → delta > 임계값 && 마지막 걸음 이후 300ms 초과 → 걸음 1개
//! ```
//!
//! - 첫 번째 샘플은 `s_prev`를 채우기만 합니다.
//! - 마지막으로 처리한 샘플과 33ms 미만 간격인 샘플, 유한하지 않은 값이 있는 샘플은 버립니다.

use crate::models::pedometer::MotionSample;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub threshold: f64,
    pub min_step_interval_ms: i64,
    pub window_size: usize,
    pub min_sample_interval_ms: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 10.0,
            min_step_interval_ms: 300,
            window_size: 5,
            min_sample_interval_ms: 33,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepDetector {
    config: DetectorConfig,
    window: VecDeque<f64>,
    previous: Option<f64>,
    last_sample_at: Option<i64>,
    last_step_at: Option<i64>,
    steps: u64,
}

impl StepDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size.max(1)),
            config,
            previous: None,
            last_sample_at: None,
            last_step_at: None,
            steps: 0,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// 샘플 하나를 처리합니다. 이 샘플에서 걸음이 감지되면 `true`.
    pub fn push(&mut self, sample: &MotionSample) -> bool {
        if !sample.is_finite() {
            return false;
        }
        if let Some(last) = self.last_sample_at {
            if sample.timestamp.saturating_sub(last) < self.config.min_sample_interval_ms {
                return false;
            }
        }
        self.last_sample_at = Some(sample.timestamp);

        let smoothed = self.smooth(sample.magnitude());
        let Some(previous) = self.previous.replace(smoothed) else {
            return false;
        };

        let delta = (smoothed - previous).abs();
        let debounced = self
            .last_step_at
            .map_or(true, |at| sample.timestamp.saturating_sub(at) > self.config.min_step_interval_ms);

        if delta > self.config.threshold && debounced {
            self.last_step_at = Some(sample.timestamp);
            self.steps += 1;
            true
        } else {
            false
        }
    }

    /// 지금까지 감지한 걸음 수
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// 신호 상태(이동 평균, 직전 값)를 비웁니다. 걸음 수와 debounce 시각은 유지됩니다.
    pub fn reset(&mut self) {
        self.window.clear();
        self.previous = None;
        self.last_sample_at = None;
    }

    fn smooth(&mut self, magnitude: f64) -> f64 {
        self.window.push_back(magnitude);
        while self.window.len() > self.config.window_size.max(1) {
            self.window.pop_front();
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(z: f64, timestamp: i64) -> MotionSample {
        MotionSample { x: 0.0, y: 0.0, z, timestamp }
    }

    fn unsmoothed() -> StepDetector {
        StepDetector::new(DetectorConfig {
            window_size: 1,
            ..DetectorConfig::default()
        })
    }

    #[test]
    fn test_alternating_deltas_count_once_each() {
        let mut detector = unsmoothed();
        let detected: Vec<bool> = (0..5)
            .map(|i| detector.push(&sample(if i % 2 == 0 { 0.0 } else { 20.0 }, i * 400)))
            .collect();

        assert_eq!(detected, vec![false, true, true, true, true]);
        assert_eq!(detector.steps(), 4);
    }

    #[test]
    fn test_samples_inside_debounce_window_never_count() {
        let mut detector = unsmoothed();
        for i in 0..5 {
            detector.push(&sample(if i % 2 == 0 { 0.0 } else { 20.0 }, i * 100));
        }
        // 100ms에 한 번 감지된 뒤, 400ms까지는 모두 300ms 이내
        assert_eq!(detector.steps(), 1);
    }

    #[test]
    fn test_fast_samples_are_skipped() {
        let mut detector = unsmoothed();
        detector.push(&sample(0.0, 0));
        assert!(!detector.push(&sample(50.0, 20)));
        // 20ms 샘플은 직전 값이 되지 않습니다
        assert!(detector.push(&sample(50.0, 400)));
    }

    #[test]
    fn test_non_finite_samples_are_skipped() {
        let mut detector = unsmoothed();
        detector.push(&sample(0.0, 0));
        assert!(!detector.push(&sample(f64::NAN, 400)));
        assert!(!detector.push(&MotionSample { x: f64::INFINITY, y: 0.0, z: 0.0, timestamp: 800 }));
        assert_eq!(detector.steps(), 0);
    }

    #[test]
    fn test_window_dampens_spikes() {
        let baseline = |detector: &mut StepDetector| {
            for i in 0..5 {
                detector.push(&sample(9.8, i * 50));
            }
        };

        // 평균이 40/5 = 8만큼 오르므로 임계값 미만
        let mut small = StepDetector::new(DetectorConfig::default());
        baseline(&mut small);
        assert!(!small.push(&sample(49.8, 400)));

        // 평균이 60/5 = 12만큼 오르므로 걸음
        let mut large = StepDetector::new(DetectorConfig::default());
        baseline(&mut large);
        assert!(large.push(&sample(69.8, 400)));
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut detector = unsmoothed();
        assert!(!detector.push(&sample(0.0, i64::MIN)));
        assert!(detector.push(&sample(50.0, i64::MAX)));
        // 시간이 거꾸로 가면 너무 빠른 샘플로 취급
        assert!(!detector.push(&sample(0.0, i64::MIN)));
        assert_eq!(detector.steps(), 1);
    }

    #[test]
    fn test_first_sample_only_primes() {
        let mut detector = unsmoothed();
        assert!(!detector.push(&sample(100.0, 1_000)));
        detector.reset();
        assert!(!detector.push(&sample(0.0, 2_000)));
        assert_eq!(detector.steps(), 0);
    }
}
