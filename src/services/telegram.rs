//! # Telegram 메시지 전송
//!
//! 일회용 코드(OTP)를 사용자에게 전달하는 채널(`Courier`)입니다.
//!
//! ## 동작 모드
//! - `Courier::Telegram`: Bot API `sendMessage`를 호출합니다 (10초 타임아웃)
//! - `Courier::Demo`: 토큰이 없거나 형식이 틀리면 사용됩니다.
//!   메시지를 로그로 남기고 메모리 outbox에 쌓기만 합니다.
//!
//! ## 메시지 형식
//! Bot API의 `parse_mode: "HTML"`을 사용합니다. 사용자 입력(닉네임)은 반드시 이스케이프합니다.

use crate::error::AppError;
use crate::models::verification::{CodePurpose, OutgoingMessage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bot API 공통 응답 형식: `{ ok, result?, description?, error_code? }`
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<u16>,
}

/// `getMe` 결과
#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API 클라이언트
#[derive(Clone)]
pub struct TelegramBot {
    http: reqwest::Client,
    api_base: String,
    token: String,
    username: String,
}

impl std::fmt::Debug for TelegramBot {
    // 토큰은 로그에 그대로 찍히면 안 됩니다
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBot")
            .field("api_base", &self.api_base)
            .field("token", &mask_token(&self.token))
            .field("username", &self.username)
            .finish()
    }
}

impl TelegramBot {
    pub fn new(api_base: &str, token: &str, username: &str) -> Result<Self, AppError> {
        if !validate_token(token) {
            return Err(AppError::InvalidInput("Invalid Telegram bot token format".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            username: username.trim_start_matches('@').to_string(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn masked_token(&self) -> String {
        mask_token(&self.token)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// 연결 확인용. 봇 자신의 정보를 가져옵니다.
    pub async fn get_me(&self) -> Result<BotIdentity, AppError> {
        let response = self
            .http
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let body: ApiResponse<BotIdentity> = response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("Unreadable Telegram response: {}", e)))?;

        match (body.ok, body.result) {
            (true, Some(me)) => Ok(me),
            _ => Err(AppError::Delivery(describe_error(
                body.error_code.or(Some(status)),
                body.description.as_deref().unwrap_or("getMe failed"),
            ))),
        }
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), AppError> {
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("Unreadable Telegram response: {}", e)))?;

        if body.ok {
            tracing::debug!(chat_id, "Telegram message sent");
            return Ok(());
        }

        let description = body.description.unwrap_or_else(|| "Unknown error".to_string());
        tracing::warn!(chat_id, status, %description, "Telegram rejected the message");
        Err(AppError::Delivery(describe_error(
            body.error_code.or(Some(status)),
            &description,
        )))
    }
}

/// 메시지 전달 채널
#[derive(Debug, Clone)]
pub enum Courier {
    Telegram(TelegramBot),
    Demo(DemoOutbox),
}

/// 데모 모드에서 "보낸" 메시지 목록
#[derive(Debug, Clone, Default)]
pub struct DemoOutbox {
    username: String,
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
}

impl DemoOutbox {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.trim_start_matches('@').to_string(),
            sent: Arc::default(),
        }
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn push(&self, message: OutgoingMessage) {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(message);
    }
}

impl Courier {
    /// 토큰이 없거나 형식이 틀리면 데모 모드입니다.
    pub fn from_settings(api_base: &str, token: Option<&str>, username: &str) -> Result<Self, AppError> {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) if validate_token(token) => {
                let bot = TelegramBot::new(api_base, token, username)?;
                tracing::info!(token = %bot.masked_token(), "Telegram courier enabled");
                Ok(Courier::Telegram(bot))
            }
            Some(token) => {
                tracing::warn!(token = %mask_token(token), "Malformed Telegram bot token, using demo mode");
                Ok(Courier::Demo(DemoOutbox::new(username)))
            }
            None => {
                tracing::info!("No Telegram bot token configured, using demo mode");
                Ok(Courier::Demo(DemoOutbox::new(username)))
            }
        }
    }

    pub fn demo(username: &str) -> Self {
        Courier::Demo(DemoOutbox::new(username))
    }

    pub fn is_demo(&self) -> bool {
        matches!(self, Courier::Demo(_))
    }

    pub fn bot_username(&self) -> &str {
        match self {
            Courier::Telegram(bot) => bot.username(),
            Courier::Demo(outbox) => &outbox.username,
        }
    }

    /// 데모 모드의 outbox 내용. Telegram 모드에서는 비어 있습니다.
    pub fn outbox(&self) -> Vec<OutgoingMessage> {
        match self {
            Courier::Telegram(_) => Vec::new(),
            Courier::Demo(outbox) => outbox.messages(),
        }
    }

    pub async fn send(&self, chat_id: i64, text: &str) -> Result<(), AppError> {
        match self {
            Courier::Telegram(bot) => bot.send_message(chat_id, text).await,
            Courier::Demo(outbox) => {
                tracing::info!(chat_id, text, "Demo mode: message not sent to Telegram");
                outbox.push(OutgoingMessage {
                    chat_id,
                    text: text.to_string(),
                });
                Ok(())
            }
        }
    }

    pub async fn send_code(&self, chat_id: i64, purpose: CodePurpose, code: &str) -> Result<(), AppError> {
        let text = code_message(purpose, code, self.bot_username());
        self.send(chat_id, &text).await
    }

    /// Telegram 연결 직후 보내는 환영 메시지
    pub async fn send_welcome(&self, chat_id: i64, nickname: &str) -> Result<(), AppError> {
        let text = format!(
            "👋 <b>Welcome to MeetUP, {}!</b>\n\n\
             ✅ Your Telegram account is now linked to MeetUP.\n\n\
             📱 <b>What you get:</b>\n\
             • Verification codes\n\
             • Password reset through Telegram\n\
             • Security notifications\n\n\
             🔐 <b>Your Chat ID:</b> <code>{}</code>\n\n\
             🙏 Thank you for using MeetUP!",
            escape_html(nickname),
            chat_id
        );
        self.send(chat_id, &text).await
    }
}

/// 코드 전달 메시지 (HTML)
pub fn code_message(purpose: CodePurpose, code: &str, bot_username: &str) -> String {
    match purpose {
        CodePurpose::Verification => format!(
            "🔐 <b>MeetUP verification code</b>\n\n\
             🆔 <b>Code:</b> <code><b>{}</b></code>\n\n\
             ⏰ <b>Valid for:</b> 10 minutes\n\
             🔒 <b>Security:</b> never share this code\n\n\
             🤖 <b>Bot:</b> @{}",
            code, bot_username
        ),
        CodePurpose::PasswordReset => format!(
            "🔄 <b>MeetUP password reset</b>\n\n\
             🔐 <b>Reset code:</b> <code><b>{}</b></code>\n\n\
             ⏰ <b>Valid for:</b> 10 minutes\n\
             ⚠️ <b>Note:</b> if this was not you, ignore this message\n\n\
             🤖 <b>Bot:</b> @{}",
            code, bot_username
        ),
    }
}

/// `<숫자>:<영문/숫자/_/->` 형식인지 확인합니다.
pub fn validate_token(token: &str) -> bool {
    let Some((id, secret)) = token.split_once(':') else {
        return false;
    };
    !id.is_empty()
        && id.chars().all(|c| c.is_ascii_digit())
        && !secret.is_empty()
        && secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 로그용 토큰 마스킹: 앞 4자 + `***` + 뒤 4자
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 10 {
        return "***INVALID***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Telegram 에러 설명을 사람이 읽을 수 있는 문장으로 바꿉니다.
pub fn describe_error(status: Option<u16>, description: &str) -> String {
    let lower = description.to_lowercase();
    if lower.contains("chat not found") {
        return "Chat not found. The user has not started a conversation with the bot".to_string();
    }
    if lower.contains("bot was blocked") {
        return "The user has blocked the bot".to_string();
    }
    match status {
        Some(401) => "Invalid bot token".to_string(),
        Some(404) => "Bot token not found".to_string(),
        Some(429) => "Too many requests to Telegram, try again later".to_string(),
        _ => description.to_string(),
    }
}

fn network_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Delivery("Telegram request timed out".to_string())
    } else {
        AppError::Delivery(format!("Network problem while contacting Telegram: {}", e))
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
