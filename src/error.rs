//! # 에러 처리 모듈
//!
//! 모든 모듈(만보기, 사용자, 채팅, 알림, 인증 코드)이 공유하는 에러 타입을 정의합니다.
//! Rust에서는 예외(exception) 대신 `Result<T, E>` 타입으로 에러를 처리합니다.
//!
//! 이 모듈의 핵심:
//! - `AppError` 열거형(enum): 모든 에러 종류를 하나의 타입으로 통합
//! - `code()` / `user_message()`: 에러를 화면에 보여줄 수 있는 (코드, 메시지) 쌍으로 변환
//!
//! 에러 분류 원칙:
//! - 읽기 쪽 파싱 실패는 에러가 아닙니다. 기본값으로 대체됩니다 (`db::lenient` 참고).
//! - 쓰기 실패는 반드시 호출자에게 전달됩니다 (`StorageUnavailable`).

use thiserror::Error;

/// 애플리케이션에서 발생할 수 있는 모든 에러 종류
///
/// 서비스 함수는 `Result<T, AppError>`를 반환하고,
/// 호출자는 `match`로 variant를 구분하여 처리합니다.
#[derive(Debug, Error)]
pub enum AppError {
    /// 찾는 엔티티가 없음 (사용자, 채팅, 친구 요청 등)
    #[error("Not found: {0}")]
    NotFound(String),

    /// 입력값 검증 실패 (빈 닉네임, 범위를 벗어난 좌표, 잘못된 JSON 등)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 유일성 제약 위반
    /// `field`는 충돌한 필드 이름입니다 (예: "email", "nickname", "friend_request").
    #[error("Conflict on {field}: {message}")]
    Conflict {
        field: &'static str,
        message: String,
    },

    /// 인증 실패 (잘못된 비밀번호, 비활성 계정, 틀린 인증 코드)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 저장소 쓰기 실패 (용량 초과, DB 오류). 한 번 재시도한 뒤에도 실패하면 반환됩니다.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// 외부 메시지 전송 실패 (Telegram Bot API)
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// 내부 오류
    #[error("Internal error: {0}")]
    Internal(String),

    /// 데이터베이스 오류
    /// #[from]: sqlx::Error → AppError::Database 자동 변환 (`?` 연산자 사용 가능)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 파일 입출력 오류
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// 충돌 에러를 간편하게 생성합니다.
    pub fn conflict(field: &'static str, message: impl Into<String>) -> Self {
        AppError::Conflict {
            field,
            message: message.into(),
        }
    }

    /// 기계가 읽을 수 있는 안정적인 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Conflict { .. } => "conflict",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::StorageUnavailable(_) => "storage_unavailable",
            AppError::Delivery(_) => "delivery_failed",
            AppError::Internal(_) => "internal_error",
            AppError::Database(_) => "database_error",
            AppError::Io(_) => "io_error",
        }
    }

    /// 사용자에게 보여줄 메시지를 만듭니다.
    ///
    /// 내부 에러(Database, IO, Internal)는 실제 에러 내용을 로그에만 기록하고,
    /// 사용자에게는 일반적인 메시지만 반환합니다.
    pub fn user_message(&self) -> String {
        match self {
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::InvalidInput(msg) | AppError::Unauthorized(msg) => msg.clone(),
            AppError::Conflict { message, .. } => message.clone(),
            AppError::StorageUnavailable(msg) => {
                tracing::error!("Storage unavailable: {}", msg);
                "Local storage is unavailable. Changes were not saved".to_string()
            }
            AppError::Delivery(msg) => {
                tracing::warn!("Delivery failed: {}", msg);
                format!("Could not deliver the message: {}", msg)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "A database error occurred".to_string()
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                "An IO error occurred".to_string()
            }
        }
    }
}
