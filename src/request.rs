//! Wire protocol between the widget and the engine.
//!
//! The widget POSTs a form with a single `payload` field holding
//! base64-encoded JSON. Responses with a body use the same encoding.

use crate::error::{ErrorCode, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Form field carrying the encoded payload.
pub const PAYLOAD_FIELD: &str = "payload";

/// Framework-neutral view of an inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct CaptchaRequest {
    pub method: String,
    /// Header names are stored lowercased.
    headers: BTreeMap<String, String>,
    form: BTreeMap<String, String>,
    /// IP address or host-chosen identifier of the visitor.
    pub visitor: String,
}

impl CaptchaRequest {
    pub fn new(method: impl Into<String>, visitor: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            visitor: visitor.into(),
            ..Default::default()
        }
    }

    pub fn post(visitor: impl Into<String>) -> Self {
        Self::new("POST", visitor)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    /// Add every field of an `application/x-www-form-urlencoded` body.
    pub fn with_form_body(mut self, body: &str) -> Self {
        self.form.extend(parse_form(body));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }
}

/// Parse an urlencoded form body. Malformed escapes keep their raw text.
pub fn parse_form(body: &str) -> BTreeMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Outbound response for the host framework to send as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CaptchaResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, String::new())
    }

    pub fn bad_request() -> Self {
        Self::empty(400)
    }

    /// 200 with an encoded `{"error": <code>}` body.
    pub fn error(code: ErrorCode) -> Result<Self> {
        Ok(Self::ok(encode_body(&ErrorBody { error: code, data: None })?))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Load,
    Selection,
    Invalidate,
}

/// Decoded widget payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub action: Action,
    pub widget_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    pub timestamp: i64,
    pub init_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Payload {
    /// Decode base64 JSON. Returns `None` for anything malformed.
    pub fn decode(raw: &str) -> Option<Self> {
        // Unescaped '+' arrives as a space after form decoding.
        let cleaned: String = raw.trim().replace(' ', "+");
        let bytes = general_purpose::STANDARD.decode(cleaned).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn encode(&self) -> Result<String> {
        encode_body(self)
    }

    /// Field and timestamp checks for a payload received at `now`.
    pub fn check(&self, now: i64) -> std::result::Result<(), ErrorCode> {
        if !is_uuid_v4(&self.widget_id) {
            return Err(ErrorCode::InvalidRequest);
        }
        if self.action != Action::Load {
            match &self.challenge_id {
                Some(id) if is_uuid_v4(id) => {}
                _ => return Err(ErrorCode::InvalidRequest),
            }
        } else if let Some(id) = &self.challenge_id {
            if !is_uuid_v4(id) {
                return Err(ErrorCode::InvalidRequest);
            }
        }
        if self.action == Action::Selection
            && (self.x.is_none() || self.y.is_none() || self.width.is_none())
        {
            return Err(ErrorCode::InvalidRequest);
        }
        if self.init_timestamp <= 0
            || self.timestamp > now
            || self.init_timestamp > now
            || self.init_timestamp > self.timestamp
        {
            return Err(ErrorCode::InvalidRequest);
        }
        Ok(())
    }
}

/// Whether `value` is a hyphenated version 4 UUID.
pub fn is_uuid_v4(value: &str) -> bool {
    value.len() == 36
        && uuid::Uuid::parse_str(value)
            .map(|id| id.get_version_num() == 4)
            .unwrap_or(false)
}

/// Serialize to JSON and base64-encode.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(serde_json::to_vec(value)?))
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    /// Remaining timeout in ms for `too-many-attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i64>,
}

/// Body of a successful LOAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub identifier: String,
    /// Base64 PNG.
    pub challenge: String,
    pub expired_at: i64,
    pub timestamp: i64,
}

/// Body of a processed SELECTION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResponse {
    pub identifier: String,
    pub completed: bool,
    pub expired_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET: &str = "8f0c4a43-7a0e-4d4e-9a5b-0c8e2f1d3b6a";
    const CHALLENGE: &str = "2b7e1f4c-9d3a-4c6b-8e5f-1a2b3c4d5e6f";

    fn load(now: i64) -> Payload {
        Payload {
            action: Action::Load,
            widget_id: WIDGET.into(),
            challenge_id: None,
            timestamp: now - 10,
            init_timestamp: now - 500,
            theme: Some("light".into()),
            x: None,
            y: None,
            width: None,
            token: Some("t".into()),
        }
    }

    #[test]
    fn test_decode_wire_payload() {
        let raw = general_purpose::STANDARD.encode(
            r#"{"action":"SELECTION","widgetId":"8f0c4a43-7a0e-4d4e-9a5b-0c8e2f1d3b6a","challengeId":"2b7e1f4c-9d3a-4c6b-8e5f-1a2b3c4d5e6f","timestamp":1000,"initTimestamp":900,"x":12.5,"y":20,"width":320}"#,
        );
        let payload = Payload::decode(&raw).unwrap();
        assert_eq!(payload.action, Action::Selection);
        assert_eq!(payload.challenge_id.as_deref(), Some(CHALLENGE));
        assert_eq!(payload.x, Some(12.5));
        assert_eq!(payload.width, Some(320.0));
        assert!(payload.check(1_000).is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Payload::decode("not base64!").is_none());
        assert!(Payload::decode(&general_purpose::STANDARD.encode("{}")).is_none());
        let unknown_action = general_purpose::STANDARD.encode(
            r#"{"action":"DELETE","widgetId":"x","timestamp":1,"initTimestamp":1}"#,
        );
        assert!(Payload::decode(&unknown_action).is_none());
    }

    #[test]
    fn test_form_decoding_keeps_plus() {
        let payload = load(5_000);
        let encoded = payload.encode().unwrap();
        // A client that forgot to escape '+' still decodes.
        let form = parse_form(&format!("payload={}", encoded));
        assert_eq!(Payload::decode(&form[PAYLOAD_FIELD]).unwrap(), payload);

        let escaped = urlencoding::encode(&encoded).into_owned();
        let form = parse_form(&format!("a=1&payload={}&b", escaped));
        assert_eq!(Payload::decode(&form[PAYLOAD_FIELD]).unwrap(), payload);
        assert_eq!(form["b"], "");
    }

    #[test]
    fn test_check_ids() {
        let now = 5_000;
        assert!(load(now).check(now).is_ok());

        let mut bad = load(now);
        bad.widget_id = "widget".into();
        assert_eq!(bad.check(now), Err(ErrorCode::InvalidRequest));

        // Version 1 UUID.
        bad.widget_id = "c232ab00-9414-11ec-b3c8-9f6bdeced846".into();
        assert_eq!(bad.check(now), Err(ErrorCode::InvalidRequest));

        let mut selection = load(now);
        selection.action = Action::Selection;
        selection.x = Some(1.0);
        selection.y = Some(1.0);
        selection.width = Some(320.0);
        assert_eq!(selection.check(now), Err(ErrorCode::InvalidRequest));
        selection.challenge_id = Some(CHALLENGE.into());
        assert!(selection.check(now).is_ok());
        selection.width = None;
        assert_eq!(selection.check(now), Err(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_check_timestamps() {
        let now = 5_000;
        let mut payload = load(now);
        payload.timestamp = now + 1;
        assert_eq!(payload.check(now), Err(ErrorCode::InvalidRequest));

        let mut payload = load(now);
        payload.init_timestamp = payload.timestamp + 1;
        assert_eq!(payload.check(now), Err(ErrorCode::InvalidRequest));

        let mut payload = load(now);
        payload.timestamp = now;
        payload.init_timestamp = now;
        assert!(payload.check(now).is_ok());
    }

    #[test]
    fn test_request_lookup() {
        let request = CaptchaRequest::post("203.0.113.7")
            .with_header("X-IconCaptcha-Token", "abc")
            .with_form_body("payload=xyz&ic-hp=");
        assert_eq!(request.header("x-iconcaptcha-token"), Some("abc"));
        assert_eq!(request.field("payload"), Some("xyz"));
        assert_eq!(request.field("ic-hp"), Some(""));
        assert!(request.is_method("post"));
    }

    #[test]
    fn test_error_body() {
        let response = CaptchaResponse::error(ErrorCode::InvalidFormToken).unwrap();
        let json = general_purpose::STANDARD.decode(&response.body).unwrap();
        assert_eq!(json, br#"{"error":"invalid-form-token"}"#);
    }
}
