//! Error types for the icon-captcha library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the icon-captcha library.
///
/// These are faults: configuration mistakes, storage failures and broken
/// assets. Expected outcomes such as a wrong icon or an expired challenge are
/// reported through [`ErrorCode`] instead.
#[derive(Error, Debug)]
pub enum CaptchaError {
    /// Invalid options or connection configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown storage driver name
    #[error("Unsupported storage driver: {0}")]
    UnsupportedDriver(String),

    /// Storage backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Image processing error
    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Regex error
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl From<rusqlite::Error> for CaptchaError {
    fn from(e: rusqlite::Error) -> Self {
        CaptchaError::Storage(e.to_string())
    }
}

impl From<image::ImageError> for CaptchaError {
    fn from(e: image::ImageError) -> Self {
        CaptchaError::ImageProcessing(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CaptchaError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CaptchaError::Storage("lock poisoned".into())
    }
}

/// Result type alias for icon-captcha operations.
pub type Result<T> = std::result::Result<T, CaptchaError>;

/// User-facing outcome codes.
///
/// Serialized in kebab-case so they can be sent to the widget as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Form token missing or not matching the visitor session
    InvalidFormToken,
    /// Challenge missing, never rendered or otherwise unusable
    InvalidChallenge,
    /// Challenge past its expiry timestamp
    ExpiredChallenge,
    /// Challenge exists but the correct icon was never selected
    UnsolvedChallenge,
    /// Required form fields are missing
    EmptyForm,
    /// Visitor is in an attempts timeout
    TooManyAttempts,
    /// Honeypot field was filled in
    Honeypot,
    /// Payload could not be decoded or failed validation
    InvalidRequest,
    /// Challenge image was already fetched once
    ChallengeRequested,
}

impl ErrorCode {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidFormToken => "invalid-form-token",
            ErrorCode::InvalidChallenge => "invalid-challenge",
            ErrorCode::ExpiredChallenge => "expired-challenge",
            ErrorCode::UnsolvedChallenge => "unsolved-challenge",
            ErrorCode::EmptyForm => "empty-form",
            ErrorCode::TooManyAttempts => "too-many-attempts",
            ErrorCode::Honeypot => "honeypot",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::ChallengeRequested => "challenge-requested",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(ErrorCode::InvalidFormToken.as_str(), "invalid-form-token");
        let json = serde_json::to_string(&ErrorCode::TooManyAttempts).unwrap();
        assert_eq!(json, "\"too-many-attempts\"");
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: CaptchaError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CaptchaError::Storage(_)));
    }
}
