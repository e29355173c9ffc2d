//! # MeetUP 만보기 재생기
//!
//! 모션 샘플 로그를 만보기에 재생하고 결과 통계를 JSON으로 출력합니다.
//!
//! ```text
//! meetup samples.jsonl     # 파일에서 읽기
//! cat samples.jsonl | meetup   # stdin에서 읽기
//! ```
//!
//! 한 줄에 샘플 하나: `{"x":0.1,"y":9.7,"z":0.3,"timestamp":1714550400000}`
//!
//! 실행 순서:
//! 1. 환경변수(.env) 로딩
//! 2. 로깅(tracing) 초기화
//! 3. 데이터베이스 연결, 마이그레이션
//! 4. `AppState` 생성
//! 5. 샘플 재생 → 추적 종료 → 통계 출력

use anyhow::{Context, Result};
use meetup::clock::SystemClock;
use meetup::config::Config;
use meetup::models::pedometer::MotionSample;
use meetup::{db, AppState};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1단계: 환경변수 로딩 ──
    // .env 파일이 없어도 에러 없이 넘어갑니다.
    dotenvy::dotenv().ok();

    // ── 2단계: 로깅 초기화 ──
    // 로그는 stderr로 보내고, stdout에는 통계 JSON만 남깁니다.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meetup=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // ── 3단계: 설정, 데이터베이스 ──
    let config = Config::from_env()?;
    tracing::info!("Opening store at {}", config.database_url);
    let pool = db::connect(&config.database_url).await?;

    // ── 4단계: 애플리케이션 상태 ──
    let state = AppState::open(pool, &config, Arc::new(SystemClock)).await?;

    // ── 5단계: 샘플 재생 ──
    let detected = match std::env::args().nth(1) {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path))?;
            replay(&state, BufReader::new(file)).await?
        }
        None => replay(&state, BufReader::new(tokio::io::stdin())).await?,
    };

    let stats = state.pedometer.lock().await.stop_tracking().await?;
    tracing::info!(detected, today = stats.today, "Replay finished");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// JSON 줄을 하나씩 읽어 만보기에 넘깁니다. 감지된 걸음 수를 반환합니다.
async fn replay<R: AsyncBufRead + Unpin>(state: &AppState, reader: R) -> Result<u64> {
    let mut pedometer = state.pedometer.lock().await;
    if !pedometer.start_tracking() {
        anyhow::bail!("No motion source available (MOTION_SENSOR_AVAILABLE=false)");
    }

    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut detected = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MotionSample>(line) {
            Ok(sample) => {
                if pedometer.on_motion(sample).await? {
                    detected += 1;
                }
            }
            Err(e) => tracing::warn!(line = line_no, error = %e, "Skipping malformed sample"),
        }
    }
    Ok(detected)
}
