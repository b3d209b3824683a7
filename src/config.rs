//! Captcha options.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! icon_path = "assets/icons"
//!
//! [challenge.icon_amount]
//! min = 5
//! max = 6
//!
//! [storage]
//! driver = "sqlite"
//! connection = { path = "/var/lib/captcha/captcha.db" }
//! ```

use crate::error::{CaptchaError, Result};
use crate::storage::StorageDriver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Smallest number of icons a challenge can show.
pub const MIN_ICON_AMOUNT: u32 = 5;
/// Largest number of icons a challenge can show.
pub const MAX_ICON_AMOUNT: u32 = 8;

/// Separator color used when a theme has none.
pub const DEFAULT_BORDER_COLOR: [u8; 3] = [211, 211, 211];

/// Name of the theme unknown theme names fall back to.
pub const FALLBACK_THEME: &str = "light";

/// Top-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaOptions {
    /// Directory holding one sub-directory per icon set.
    pub icon_path: PathBuf,
    /// Optional placeholder canvas; a blank canvas is used when absent.
    pub placeholder: Option<PathBuf>,
    pub themes: BTreeMap<String, ThemeOptions>,
    pub challenge: ChallengeOptions,
    pub attempts: AttemptsOptions,
    pub token: TokenOptions,
    pub validation: ValidationOptions,
    pub storage: StorageOptions,
    pub cors: CorsOptions,
}

impl Default for CaptchaOptions {
    fn default() -> Self {
        Self {
            icon_path: PathBuf::from("assets/icons"),
            placeholder: None,
            themes: default_themes(),
            challenge: ChallengeOptions::default(),
            attempts: AttemptsOptions::default(),
            token: TokenOptions::default(),
            validation: ValidationOptions::default(),
            storage: StorageOptions::default(),
            cors: CorsOptions::default(),
        }
    }
}

/// Visual variant of the widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeOptions {
    /// Icon set directory name, relative to `icon_path`.
    pub icons: String,
    /// Separator color.
    #[serde(default)]
    pub color: Option<[u8; 3]>,
}

impl ThemeOptions {
    fn new(icons: &str, color: [u8; 3]) -> Self {
        Self {
            icons: icons.to_string(),
            color: Some(color),
        }
    }

    pub fn border_color(&self) -> [u8; 3] {
        self.color.unwrap_or(DEFAULT_BORDER_COLOR)
    }
}

fn default_themes() -> BTreeMap<String, ThemeOptions> {
    BTreeMap::from([
        ("light".to_string(), ThemeOptions::new("light", [238, 238, 238])),
        ("legacy-light".to_string(), ThemeOptions::new("light", [240, 240, 240])),
        ("dark".to_string(), ThemeOptions::new("dark", [64, 64, 64])),
        ("legacy-dark".to_string(), ThemeOptions::new("dark", [64, 64, 64])),
    ])
}

/// Inclusive icon count bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconAmount {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlipOptions {
    pub horizontally: bool,
    pub vertically: bool,
}

impl Default for FlipOptions {
    fn default() -> Self {
        Self {
            horizontally: true,
            vertically: true,
        }
    }
}

/// Seconds until a challenge expires. 0 disables expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationOptions {
    /// Applied when a challenge is generated.
    pub inactivity: u64,
    /// Applied when the correct icon is selected.
    pub completion: u64,
}

impl Default for ExpirationOptions {
    fn default() -> Self {
        Self {
            inactivity: 120,
            completion: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeOptions {
    /// Icon ids are drawn from `1..=available_icons`.
    pub available_icons: u32,
    pub icon_amount: IconAmount,
    pub rotate: bool,
    pub flip: FlipOptions,
    pub border: bool,
    pub expiration: ExpirationOptions,
}

impl Default for ChallengeOptions {
    fn default() -> Self {
        Self {
            available_icons: 180,
            icon_amount: IconAmount {
                min: MIN_ICON_AMOUNT,
                max: MAX_ICON_AMOUNT,
            },
            rotate: true,
            flip: FlipOptions::default(),
            border: true,
            expiration: ExpirationOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptsOptions {
    pub enabled: bool,
    /// Failed selections allowed before a timeout is issued.
    pub amount: u32,
    /// Timeout length in seconds.
    pub timeout: u64,
    /// Seconds a failed attempt is remembered.
    pub valid: u64,
}

impl Default for AttemptsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            amount: 5,
            timeout: 30,
            valid: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenOptions {
    pub enabled: bool,
    /// Form field / payload key carrying the token.
    pub field: String,
    /// Request header carrying the token on widget requests.
    pub header: String,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            field: "_iconcaptcha-token".into(),
            header: "X-IconCaptcha-Token".into(),
        }
    }
}

/// Names of the form fields submitted alongside the protected form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    pub widget_field: String,
    pub challenge_field: String,
    pub honeypot_field: String,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            widget_field: "ic-wid".into(),
            challenge_field: "ic-cid".into(),
            honeypot_field: "ic-hp".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// SQLite database file.
    pub path: Option<PathBuf>,
    /// Connection string for server databases.
    pub dsn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub driver: String,
    pub connection: ConnectionOptions,
    pub challenge_table: String,
    pub attempts_table: String,
    /// Delete expired records while loading challenges.
    pub purging: bool,
    /// How many random challenge ids to try before giving up.
    pub identifier_tries: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            driver: "session".into(),
            connection: ConnectionOptions::default(),
            challenge_table: "iconcaptcha_challenges".into(),
            attempts_table: "iconcaptcha_attempts".into(),
            purging: true,
            identifier_tries: 100,
        }
    }
}

impl StorageOptions {
    pub fn driver(&self) -> Result<StorageDriver> {
        self.driver.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsOptions {
    pub enabled: bool,
    /// Exact origins or `*` wildcard patterns.
    pub origins: Vec<String>,
    pub credentials: bool,
    /// Preflight cache duration in seconds.
    pub cache: u64,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            origins: Vec::new(),
            credentials: true,
            cache: 86_400,
        }
    }
}

impl CaptchaOptions {
    /// Parse and validate options from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: CaptchaOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load and validate options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges and the storage driver name.
    pub fn validate(&self) -> Result<()> {
        let amount = self.challenge.icon_amount;
        if amount.min < MIN_ICON_AMOUNT || amount.max > MAX_ICON_AMOUNT {
            return Err(CaptchaError::Config(format!(
                "icon_amount must be within {}..={}, got {}..={}",
                MIN_ICON_AMOUNT, MAX_ICON_AMOUNT, amount.min, amount.max
            )));
        }
        if amount.min > amount.max {
            return Err(CaptchaError::Config(format!(
                "icon_amount.min ({}) is larger than icon_amount.max ({})",
                amount.min, amount.max
            )));
        }
        // A layout uses up to three distinct icons.
        if self.challenge.available_icons < 3 {
            return Err(CaptchaError::Config(
                "available_icons must be at least 3".into(),
            ));
        }
        if self.attempts.enabled && self.attempts.amount == 0 {
            return Err(CaptchaError::Config(
                "attempts.amount must be at least 1 when attempts are enabled".into(),
            ));
        }
        if self.token.enabled && self.token.field.is_empty() {
            return Err(CaptchaError::Config("token.field cannot be empty".into()));
        }
        if self.storage.identifier_tries == 0 {
            return Err(CaptchaError::Config(
                "storage.identifier_tries must be at least 1".into(),
            ));
        }
        self.storage.driver()?;
        Ok(())
    }

    /// Resolve a theme by name, falling back to the light theme.
    pub fn theme(&self, name: &str) -> ThemeOptions {
        self.themes
            .get(name)
            .or_else(|| self.themes.get(FALLBACK_THEME))
            .cloned()
            .unwrap_or_else(|| ThemeOptions::new("light", [238, 238, 238]))
    }

    /// Whether `name` is a configured theme.
    pub fn has_theme(&self, name: &str) -> bool {
        self.themes.contains_key(name)
    }
}
