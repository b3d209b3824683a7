//! Cross-origin headers for widgets served from another origin.

use crate::config::CorsOptions;
use crate::error::Result;
use crate::request::{CaptchaRequest, CaptchaResponse};
use regex::Regex;

enum OriginRule {
    Exact(String),
    Pattern(Regex),
}

impl OriginRule {
    fn parse(origin: &str) -> Result<Self> {
        if !origin.contains('*') {
            return Ok(OriginRule::Exact(origin.to_ascii_lowercase()));
        }
        let pattern = origin
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^/]*");
        Ok(OriginRule::Pattern(Regex::new(&format!("(?i)^{}$", pattern))?))
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginRule::Exact(exact) => exact.eq_ignore_ascii_case(origin),
            OriginRule::Pattern(re) => re.is_match(origin),
        }
    }
}

/// Compiled CORS policy.
pub struct Cors {
    enabled: bool,
    rules: Vec<OriginRule>,
    credentials: bool,
    max_age: u64,
    allow_headers: String,
}

impl Cors {
    pub fn new(options: &CorsOptions, token_header: &str) -> Result<Self> {
        let rules = options
            .origins
            .iter()
            .map(|o| OriginRule::parse(o.trim()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            enabled: options.enabled,
            rules,
            credentials: options.credentials,
            max_age: options.cache,
            allow_headers: format!("Content-Type, X-Requested-With, {}", token_header),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(origin))
    }

    pub fn is_preflight(request: &CaptchaRequest) -> bool {
        request.is_method("OPTIONS") && request.header("Access-Control-Request-Method").is_some()
    }

    /// Answer a preflight request. Disallowed origins get a bare 204.
    pub fn preflight(&self, request: &CaptchaRequest) -> CaptchaResponse {
        let mut response = CaptchaResponse::empty(204).with_header(
            "Vary",
            "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
        );

        if let Some(origin) = self.allowed_origin(request) {
            response = self
                .origin_headers(response, origin)
                .with_header("Access-Control-Allow-Methods", "POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", self.allow_headers.as_str())
                .with_header("Access-Control-Max-Age", self.max_age.to_string());
        } else {
            tracing::debug!(origin = ?request.header("Origin"), "Preflight from disallowed origin");
        }
        response
    }

    /// Add the headers a non-preflight response needs.
    pub fn apply(&self, request: &CaptchaRequest, response: CaptchaResponse) -> CaptchaResponse {
        if !self.enabled {
            return response;
        }
        let response = response.with_header("Vary", "Origin");
        match self.allowed_origin(request) {
            Some(origin) => self.origin_headers(response, origin),
            None => response,
        }
    }

    fn allowed_origin<'r>(&self, request: &'r CaptchaRequest) -> Option<&'r str> {
        if !self.enabled {
            return None;
        }
        request.header("Origin").filter(|origin| self.is_allowed(origin))
    }

    fn origin_headers(&self, response: CaptchaResponse, origin: &str) -> CaptchaResponse {
        let response = response.with_header("Access-Control-Allow-Origin", origin);
        if self.credentials {
            response.with_header("Access-Control-Allow-Credentials", "true")
        } else {
            response
        }
    }
}

impl std::fmt::Debug for Cors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cors")
            .field("enabled", &self.enabled)
            .field("origins", &self.rules.len())
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors(origins: &[&str]) -> Cors {
        let options = CorsOptions {
            enabled: true,
            origins: origins.iter().map(|o| o.to_string()).collect(),
            credentials: true,
            cache: 600,
        };
        Cors::new(&options, "X-IconCaptcha-Token").unwrap()
    }

    fn preflight_request(origin: &str) -> CaptchaRequest {
        CaptchaRequest::new("OPTIONS", "203.0.113.7")
            .with_header("Origin", origin)
            .with_header("Access-Control-Request-Method", "POST")
    }

    #[test]
    fn test_origin_matching() {
        let cors = cors(&["https://example.com", "https://*.example.org"]);
        assert!(cors.is_allowed("https://example.com"));
        assert!(cors.is_allowed("HTTPS://EXAMPLE.COM"));
        assert!(!cors.is_allowed("https://example.com.evil.net"));
        assert!(cors.is_allowed("https://shop.example.org"));
        assert!(!cors.is_allowed("https://example.org"));
        assert!(!cors.is_allowed("https://evil.net/.example.org"));
        assert!(!cors.is_allowed("https://shopXexample.org"));
    }

    #[test]
    fn test_preflight_allowed() {
        let cors = cors(&["https://example.com"]);
        let request = preflight_request("https://example.com");
        assert!(Cors::is_preflight(&request));

        let response = cors.preflight(&request);
        assert_eq!(response.status, 204);
        assert_eq!(
            response.header("Access-Control-Allow-Origin"),
            Some("https://example.com")
        );
        assert_eq!(response.header("Access-Control-Allow-Methods"), Some("POST, OPTIONS"));
        assert_eq!(
            response.header("Access-Control-Allow-Headers"),
            Some("Content-Type, X-Requested-With, X-IconCaptcha-Token")
        );
        assert_eq!(response.header("Access-Control-Max-Age"), Some("600"));
        assert_eq!(response.header("Access-Control-Allow-Credentials"), Some("true"));
        assert!(response.header("Vary").unwrap().contains("Access-Control-Request-Headers"));
    }

    #[test]
    fn test_preflight_disallowed() {
        let cors = cors(&["https://example.com"]);
        let response = cors.preflight(&preflight_request("https://evil.net"));
        assert_eq!(response.status, 204);
        assert!(response.header("Access-Control-Allow-Origin").is_none());
        assert!(response.header("Vary").is_some());
    }

    #[test]
    fn test_apply() {
        let cors = cors(&["https://example.com"]);
        let request = CaptchaRequest::post("203.0.113.7").with_header("Origin", "https://example.com");
        let response = cors.apply(&request, CaptchaResponse::ok("x"));
        assert_eq!(response.header("Vary"), Some("Origin"));
        assert_eq!(
            response.header("Access-Control-Allow-Origin"),
            Some("https://example.com")
        );

        let disabled = Cors::new(&CorsOptions::default(), "X-IconCaptcha-Token").unwrap();
        let response = disabled.apply(&request, CaptchaResponse::ok("x"));
        assert!(response.headers.is_empty());
    }
}
