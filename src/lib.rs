//! # MeetUP 로컬 코어
//!
//! 소셜 앱 MeetUP의 클라이언트 측 핵심 로직입니다.
//! 브라우저 localStorage 대신 SQLite 키-값 테이블에 문서를 저장합니다.
//!
//! 모듈 구성:
//! - `clock`: 주입 가능한 시계
//! - `config`: 환경변수 설정
//! - `db`: 키-값 저장소와 문서 컬렉션 규약
//! - `error`: 공통 에러 타입
//! - `models`: 저장되는 문서 타입
//! - `services`: 만보기, 사용자, 채팅, 알림, 인증 코드
//! - `state`: 모든 서비스를 묶는 `AppState`

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

pub use error::AppError;
pub use state::AppState;
