//! # 데이터 모델 모듈
//!
//! 애플리케이션에서 사용하는 데이터 구조체(struct)들을 정의합니다.
//! 저장되는 모든 구조체는 `#[serde(default)]`와 관대한 필드 역직렬화(`db::lenient`)를 사용하므로,
//! 오래되었거나 일부가 깨진 JSON도 항상 읽을 수 있습니다.
//!
//! 각 하위 모듈:
//! - `user`: 사용자, 수정 요청(patch), 공개 프로필, 현재 세션
//! - `friend`: 친구 요청
//! - `chat`: 개인/공용 채팅과 메시지
//! - `notification`: 알림 설정, 권한 이력, 보낸 알림 기록
//! - `pedometer`: 센서 샘플과 걸음 통계
//! - `verification`: 일회용 인증 코드

pub mod chat;
pub mod friend;
pub mod notification;
pub mod pedometer;
pub mod user;
pub mod verification;

pub use chat::*;
pub use friend::*;
pub use notification::*;
pub use pedometer::*;
pub use user::*;
pub use verification::*;
