//! Anti-replay form token bound to the visitor session.

use crate::error::Result;
use crate::storage::{storage_key, KeyValueStore, KEY_ROOT};
use rand::RngCore;

const TOKEN_SEGMENT: &str = "token";

/// Random bytes per token; hex encoding doubles the length.
pub const TOKEN_BYTES: usize = 20;

/// Generate a fresh 40 character hex token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token stored in one visitor's session.
pub struct SessionToken<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> SessionToken<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    fn key() -> String {
        storage_key(&[KEY_ROOT, TOKEN_SEGMENT])
    }

    /// The stored token, if one was issued.
    pub fn current(&self) -> Result<Option<String>> {
        self.store.read(&Self::key())
    }

    /// Return the stored token, issuing one first if needed.
    pub fn get_or_create(&self) -> Result<String> {
        if let Some(token) = self.current()? {
            return Ok(token);
        }
        let token = generate_token();
        self.store.write(&Self::key(), &token)?;
        tracing::debug!("Issued form token");
        Ok(token)
    }

    /// Check `payload` against the stored token.
    ///
    /// When `header` is given it has to match as well.
    pub fn validate(&self, payload: Option<&str>, header: Option<&str>) -> Result<bool> {
        let Some(stored) = self.current()? else {
            return Ok(false);
        };
        let Some(payload) = payload else {
            return Ok(false);
        };
        if !constant_time_eq(stored.as_bytes(), payload.as_bytes()) {
            return Ok(false);
        }
        Ok(header.map_or(true, |h| constant_time_eq(stored.as_bytes(), h.as_bytes())))
    }

    /// Hidden input carrying the token, for embedding in the protected form.
    pub fn hidden_field(&self, field_name: &str) -> Result<String> {
        let token = self.get_or_create()?;
        Ok(format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\">",
            escape_html(field_name),
            escape_html(&token)
        ))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
