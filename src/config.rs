//! # 애플리케이션 설정(Configuration) 모듈
//!
//! 환경변수에서 설정값을 읽어오는 모듈입니다.
//! `.env` 파일이나 시스템 환경변수에서 값을 가져옵니다.
//!
//! 설정 항목:
//! - `DATABASE_URL`: SQLite 데이터베이스 경로
//! - `STORAGE_QUOTA_BYTES`: 전체 슬롯 용량 제한 (없으면 무제한)
//! - `STORE_WRITER_MODE`: `single` 또는 `locked`
//! - `STORE_BACKUP_LIMIT`: 컬렉션마다 보관할 백업 수
//! - `PEDOMETER_*`, `MOTION_SENSOR_AVAILABLE`: 만보기 설정
//! - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_BOT_USERNAME`, `TELEGRAM_API_BASE`: 인증 코드 전달

use crate::db::collection::{StoreOptions, WriterMode};
use crate::error::AppError;
use crate::services::pedometer::PedometerConfig;
use crate::services::step_detector::DetectorConfig;
use std::env;
use std::str::FromStr;

/// 애플리케이션 전체 설정을 담는 구조체
///
/// 시작 시 환경변수에서 한 번 읽어온 후, `AppState::open`에 넘겨집니다.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite 데이터베이스 파일 경로 (예: "sqlite:data/meetup.db")
    pub database_url: String,
    /// 모든 슬롯을 합친 최대 바이트 수
    pub storage_quota_bytes: Option<usize>,
    pub store: StoreOptions,
    pub pedometer: PedometerConfig,
    /// 없으면 데모 모드 (메시지를 로그와 메모리 outbox에만 남김)
    pub telegram_bot_token: Option<String>,
    pub telegram_bot_username: String,
    pub telegram_api_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/meetup.db".to_string(),
            storage_quota_bytes: None,
            store: StoreOptions::default(),
            pedometer: PedometerConfig::default(),
            telegram_bot_token: None,
            telegram_bot_username: "meetup_bot".to_string(),
            telegram_api_base: "https://api.telegram.org".to_string(),
        }
    }
}

impl Config {
    /// 환경변수에서 설정값을 읽어 Config 인스턴스를 생성합니다.
    ///
    /// 숫자 값은 파싱에 실패하면 기본값을 사용합니다.
    /// `STORE_WRITER_MODE`만은 알 수 없는 값이면 에러입니다.
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Config::default();
        let detector = DetectorConfig::default();

        let writer_mode = match env::var("STORE_WRITER_MODE") {
            Ok(value) => value.parse::<WriterMode>()?,
            Err(_) => defaults.store.writer_mode,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            storage_quota_bytes: env::var("STORAGE_QUOTA_BYTES")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            store: StoreOptions {
                writer_mode,
                backup_limit: parse_or("STORE_BACKUP_LIMIT", defaults.store.backup_limit),
            },
            pedometer: PedometerConfig {
                detector: DetectorConfig {
                    threshold: parse_or("PEDOMETER_THRESHOLD", detector.threshold),
                    min_step_interval_ms: parse_or("PEDOMETER_MIN_STEP_INTERVAL_MS", detector.min_step_interval_ms),
                    window_size: parse_or("PEDOMETER_WINDOW_SIZE", detector.window_size),
                    min_sample_interval_ms: parse_or(
                        "PEDOMETER_MIN_SAMPLE_INTERVAL_MS",
                        detector.min_sample_interval_ms,
                    ),
                },
                batch_size: parse_or("PEDOMETER_BATCH_SIZE", defaults.pedometer.batch_size),
                default_goal: parse_or("PEDOMETER_DEFAULT_GOAL", defaults.pedometer.default_goal),
                motion_available: parse_or("MOTION_SENSOR_AVAILABLE", defaults.pedometer.motion_available),
            },
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            telegram_bot_username: env::var("TELEGRAM_BOT_USERNAME").unwrap_or(defaults.telegram_bot_username),
            telegram_api_base: env::var("TELEGRAM_API_BASE").unwrap_or(defaults.telegram_api_base),
        })
    }
}

/// 환경변수를 파싱합니다. 없거나 파싱에 실패하면 기본값
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
