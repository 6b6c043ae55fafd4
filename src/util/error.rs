/// 外部サービス呼び出しのエラー分類。
use reqwest::StatusCode;
use thiserror::Error;

use super::retry::Retryable;

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// リトライ可能なエラー（タイムアウト、接続エラー、5xx、429）
    Retryable,
    /// リトライ不可能なエラー（入力不正、not found など）
    NonRetryable,
    /// 認証・認可エラー。リトライしても回復しない
    Unauthorized,
}

/// 外部サービスへの単一呼び出しの失敗。
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized ({status})")]
    Unauthorized { status: u16 },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::RateLimited(_) => ErrorKind::Retryable,
            Self::Upstream { status, .. } => {
                if *status >= 500 {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::NonRetryable
                }
            }
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::NotFound | Self::InvalidInput(_) | Self::Malformed(_) => {
                ErrorKind::NonRetryable
            }
        }
    }

    /// HTTPステータスと応答本文からエラーを組み立てる。
    #[must_use]
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = truncate(body, 256);
        match status {
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::InvalidInput(message)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Unauthorized {
                status: status.as_u16(),
            },
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Self::Timeout(message),
            other => Self::Upstream {
                status: other.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(error.to_string());
        }
        if error.is_connect() {
            return Self::Connect(error.to_string());
        }
        if let Some(status) = error.status() {
            return Self::from_status(status, &error.to_string());
        }
        if error.is_decode() {
            return Self::Malformed(error.to_string());
        }
        // リクエスト送信中の切断などは一時的なものとして扱う
        Self::Connect(error.to_string())
    }
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        body.to_string()
    } else {
        let mut truncated: String = body.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Retryable)]
    #[case(StatusCode::BAD_GATEWAY, ErrorKind::Retryable)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Retryable)]
    #[case(StatusCode::GATEWAY_TIMEOUT, ErrorKind::Retryable)]
    #[case(StatusCode::TOO_MANY_REQUESTS, ErrorKind::Retryable)]
    #[case(StatusCode::BAD_REQUEST, ErrorKind::NonRetryable)]
    #[case(StatusCode::NOT_FOUND, ErrorKind::NonRetryable)]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::NonRetryable)]
    #[case(StatusCode::CONFLICT, ErrorKind::NonRetryable)]
    #[case(StatusCode::UNAUTHORIZED, ErrorKind::Unauthorized)]
    #[case(StatusCode::FORBIDDEN, ErrorKind::Unauthorized)]
    fn classifies_http_status(#[case] status: StatusCode, #[case] expected: ErrorKind) {
        assert_eq!(ServiceError::from_status(status, "body").kind(), expected);
    }

    #[test]
    fn only_retryable_kinds_are_retried() {
        assert!(ServiceError::Timeout("slow".into()).is_retryable());
        assert!(ServiceError::RateLimited("429".into()).is_retryable());
        assert!(!ServiceError::NotFound.is_retryable());
        assert!(!ServiceError::Unauthorized { status: 401 }.is_retryable());
        assert!(!ServiceError::Malformed("eof".into()).is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match ServiceError::from_status(StatusCode::BAD_REQUEST, &body) {
            ServiceError::InvalidInput(message) => assert_eq!(message.chars().count(), 257),
            other => panic!("unexpected {other:?}"),
        }
    }
}
