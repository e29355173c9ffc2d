//! # 서비스 모듈
//!
//! 도메인 로직을 담당합니다. 각 서비스는 `db::Collection` 핸들을 통해서만 저장소에 접근합니다.
//! - `step_detector`: 가속도 샘플 → 걸음 (순수 신호 처리)
//! - `pedometer`: 걸음 누적, 기간 리셋, 목표
//! - `users`: 사용자 디렉토리, 친구 요청, 추천 코드, 주변 사용자
//! - `chats`: 개인/공용 채팅
//! - `notifications`: 알림 발송 조건, 발송 기록
//! - `verification`: 일회용 인증 코드
//! - `telegram`: 인증 코드 전달 (Telegram Bot API 또는 데모 모드)
//! - `geo`: 좌표 거리 계산

pub mod chats;
pub mod geo;
pub mod notifications;
pub mod pedometer;
pub mod step_detector;
pub mod telegram;
pub mod users;
pub mod verification;
