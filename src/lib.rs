//! # icon-captcha
//!
//! A server-side icon selection captcha. The widget shows a strip of icons;
//! one icon appears fewer times than the others and the visitor has to click
//! it.
//!
//! ## Features
//!
//! - **Layout Generation**: Random layouts where exactly one icon is the
//!   strict minimum, reproducible through a seedable random source.
//! - **Image Rendering**: Icons are rotated, flipped and separated on a
//!   320x50 canvas with `image`/`imageproc`, behind a pluggable backend.
//! - **Attempt Limiting**: Failed clicks count per visitor and lead to a
//!   timeout once the threshold is reached.
//! - **Pluggable Storage**: Visitor session key-value storage or relational
//!   tables (SQLite bundled, MySQL, PostgreSQL and SQL Server query sets).
//! - **Anti-Replay**: Session-bound form tokens, request timestamps, a
//!   honeypot field and single-use challenges.
//!
//! ## Quick Start
//!
//! ```ignore
//! use icon_captcha::{CaptchaOptions, CaptchaRequest, IconCaptcha, MemoryStore};
//!
//! let engine = IconCaptcha::builder(CaptchaOptions::load("captcha.toml")?).build()?;
//!
//! // The visitor's session store, provided by the web framework.
//! let session = MemoryStore::new();
//! let hidden_input = engine.token_field(&session)?;
//!
//! // Widget endpoint
//! let request = CaptchaRequest::post("203.0.113.7").with_form_body(&body);
//! let response = engine.handle(&request, &session)?;
//!
//! // Protected form submission
//! let form = CaptchaRequest::post("203.0.113.7").with_form_body(&form_body);
//! if engine.validate(&form, &session)?.is_success() {
//!     // accept the form
//! }
//! ```
//!
//! ## Storage Drivers
//!
//! - `session` - challenges live in the visitor session (default)
//! - `sqlite` - bundled SQLite, configured by `storage.connection.path`
//! - `mysql`, `pgsql`, `sqlsrv` - host-supplied connection
//! - `custom` - host-supplied connection and query strategy

#![allow(missing_docs)]

pub mod attempts;
pub mod captcha;
pub mod challenge;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod cors;
pub mod error;
pub mod generator;
pub mod hooks;
pub mod request;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod token;

// Re-exports for convenience
pub use captcha::{IconCaptcha, IconCaptchaBuilder, ValidationResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CaptchaOptions;
pub use error::{CaptchaError, ErrorCode, Result};
pub use hooks::ChallengeHooks;
pub use request::{Action, CaptchaRequest, CaptchaResponse, Payload};
pub use storage::{KeyValueStore, MemoryStore, StorageDriver};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(ErrorCode::TooManyAttempts.as_str(), "too-many-attempts");
        assert_eq!(ErrorCode::InvalidFormToken.as_str(), "invalid-form-token");
        assert_eq!(StorageDriver::Postgres.as_str(), "pgsql");
    }
}
