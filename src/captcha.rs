//! The captcha engine.

use crate::attempts::{AttemptsBackend, AttemptsTracker, KeyValueAttempts, SqlAttempts};
use crate::challenge::{Challenge, LoadOutcome, RenderOutcome, SelectionOutcome};
use crate::clock::{Clock, SystemClock};
use crate::compositor::{Compositor, CompositorSettings, RasterBackend};
use crate::config::{CaptchaOptions, FALLBACK_THEME};
use crate::cors::Cors;
use crate::error::{CaptchaError, ErrorCode, Result};
use crate::hooks::{ChallengeHooks, NoopHooks};
use crate::request::{
    encode_body, is_uuid_v4, Action, CaptchaRequest, CaptchaResponse, ErrorBody, LoadResponse,
    Payload, SelectionResponse, PAYLOAD_FIELD,
};
use crate::session::{ChallengeSession, KeyValueSessions, SessionBackend, SessionSettings, SqlSessions};
use crate::storage::{
    sql::ConnectionFactory, storage_key, ConnectionPool, Dialect, KeyLocks, KeyValueStore,
    QueryStrategy, StorageDriver, KEY_ROOT,
};
use crate::token::SessionToken;
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Builder for creating an [`IconCaptcha`] engine.
pub struct IconCaptchaBuilder {
    options: CaptchaOptions,
    seed: Option<u64>,
    clock: Option<Arc<dyn Clock>>,
    connection: Option<ConnectionFactory>,
    strategy: Option<Box<dyn QueryStrategy>>,
    hooks: Option<Arc<dyn ChallengeHooks>>,
}

impl IconCaptchaBuilder {
    pub fn new(options: CaptchaOptions) -> Self {
        Self {
            options,
            seed: None,
            clock: None,
            connection: None,
            strategy: None,
            hooks: None,
        }
    }

    /// Seed the random source for reproducible layouts and transforms.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the system clock.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Connection factory for relational drivers.
    ///
    /// Required for `mysql`, `pgsql`, `sqlsrv` and `custom`. For `sqlite`
    /// it replaces the file configured in `storage.connection.path`.
    pub fn sql_connection(mut self, factory: ConnectionFactory) -> Self {
        self.connection = Some(factory);
        self
    }

    /// Query strategy for the `custom` driver.
    ///
    /// Other drivers pick the strategy matching their dialect and ignore this.
    pub fn query_strategy(mut self, strategy: Box<dyn QueryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn hooks(mut self, hooks: impl ChallengeHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Validate options and open the storage configuration.
    pub fn build(self) -> Result<IconCaptcha> {
        self.options.validate()?;
        let driver = self.options.storage.driver()?;
        let storage = &self.options.storage;
        let tables = (storage.challenge_table.clone(), storage.attempts_table.clone());
        if driver != StorageDriver::Custom && self.strategy.is_some() {
            tracing::warn!(driver = %driver, "Query strategy ignored by this driver");
        }

        let pool = match (driver, self.connection) {
            (StorageDriver::Session, connection) => {
                if connection.is_some() {
                    tracing::warn!("SQL connection ignored by the session driver");
                }
                None
            }
            (StorageDriver::Custom, Some(factory)) => {
                let strategy = self.strategy.ok_or_else(|| {
                    CaptchaError::Config("custom storage driver requires a query strategy".into())
                })?;
                Some(ConnectionPool::with_strategy(factory, strategy, tables.0, tables.1)?)
            }
            (StorageDriver::Sqlite, None) => {
                let path = storage.connection.path.clone().ok_or_else(|| {
                    CaptchaError::Config("sqlite storage requires connection.path".into())
                })?;
                Some(ConnectionPool::sqlite(path, tables.0, tables.1)?)
            }
            (driver, Some(factory)) => {
                let dialect: Dialect = driver.dialect().ok_or_else(|| {
                    CaptchaError::Config(format!("storage driver '{}' has no SQL dialect", driver))
                })?;
                Some(ConnectionPool::new(factory, dialect, tables.0, tables.1)?)
            }
            (driver, None) => {
                return Err(CaptchaError::Config(format!(
                    "storage driver '{}' requires a connection",
                    driver
                )))
            }
        };

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cors = Cors::new(&self.options.cors, &self.options.token.header)?;
        let compositor = Compositor::new(
            RasterBackend::new(),
            CompositorSettings::from(&self.options.challenge),
        );

        tracing::info!(driver = %driver, "Captcha engine ready");

        Ok(IconCaptcha {
            driver,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            rng: Mutex::new(rng),
            pool,
            locks: KeyLocks::new(),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            cors,
            compositor,
            options: self.options,
        })
    }
}

/// Outcome of validating a submitted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResult {
    success: bool,
    error: Option<ErrorCode>,
}

impl ValidationResult {
    fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failure(code: ErrorCode) -> Self {
        Self {
            success: false,
            error: Some(code),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error
    }
}

/// Long-lived captcha engine shared by every request.
///
/// Per request, pass the [`CaptchaRequest`] and the visitor's session store.
/// The session store holds the form token, and with the `session` driver
/// also the challenges and attempt records.
pub struct IconCaptcha {
    options: CaptchaOptions,
    driver: StorageDriver,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    pool: Option<ConnectionPool>,
    locks: KeyLocks,
    hooks: Arc<dyn ChallengeHooks>,
    cors: Cors,
    compositor: Compositor<RasterBackend>,
}

impl IconCaptcha {
    pub fn builder(options: CaptchaOptions) -> IconCaptchaBuilder {
        IconCaptchaBuilder::new(options)
    }

    pub fn options(&self) -> &CaptchaOptions {
        &self.options
    }

    pub fn driver(&self) -> StorageDriver {
        self.driver
    }

    /// The visitor's form token, issued on first use.
    pub fn token(&self, session: &dyn KeyValueStore) -> Result<String> {
        SessionToken::new(session).get_or_create()
    }

    /// Hidden input carrying the form token.
    pub fn token_field(&self, session: &dyn KeyValueStore) -> Result<String> {
        SessionToken::new(session).hidden_field(&self.options.token.field)
    }

    /// Independent generator for one request, drawn from the engine's source.
    fn request_rng(&self) -> Result<StdRng> {
        let seed: u64 = self.rng.lock()?.gen();
        Ok(StdRng::seed_from_u64(seed))
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            purging: self.options.storage.purging,
            identifier_tries: self.options.storage.identifier_tries,
        }
    }

    fn backends<'s>(
        &'s self,
        session: &'s dyn KeyValueStore,
    ) -> (Box<dyn SessionBackend + 's>, Box<dyn AttemptsBackend + 's>) {
        match &self.pool {
            Some(pool) => (Box::new(SqlSessions::new(pool)), Box::new(SqlAttempts::new(pool))),
            None => (
                Box::new(KeyValueSessions::new(session)),
                Box::new(KeyValueAttempts::new(session)),
            ),
        }
    }

    /// Run `f` on the challenge while holding the widget and visitor locks.
    fn with_challenge<T>(
        &self,
        session: &dyn KeyValueStore,
        visitor: &str,
        widget_id: &str,
        challenge_id: Option<&str>,
        f: impl FnOnce(Challenge<'_>) -> Result<T>,
    ) -> Result<T> {
        let widget_key = storage_key(&[KEY_ROOT, "challenges", widget_id]);
        let visitor_key = storage_key(&[KEY_ROOT, "attempts", visitor]);

        self.locks.with_lock(&widget_key, || {
            self.locks.with_lock(&visitor_key, || {
                let (sessions, attempts) = self.backends(session);
                let challenge_session = ChallengeSession::load(
                    sessions.as_ref(),
                    self.clock.as_ref(),
                    self.session_settings(),
                    widget_id,
                    challenge_id,
                )?;
                let tracker = AttemptsTracker::new(
                    attempts.as_ref(),
                    self.clock.as_ref(),
                    &self.options.attempts,
                    visitor,
                );
                if self.options.storage.purging {
                    let purged = tracker.purge_expired()?;
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired attempt records");
                    }
                }
                f(Challenge::new(
                    &self.options,
                    challenge_session,
                    tracker,
                    self.hooks.as_ref(),
                ))
            })?
        })?
    }

    /// Handle one widget request.
    pub fn handle(
        &self,
        request: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<CaptchaResponse> {
        if Cors::is_preflight(request) {
            return Ok(self.cors.preflight(request));
        }
        let response = self.dispatch(request, session)?;
        Ok(self.cors.apply(request, response))
    }

    fn dispatch(
        &self,
        request: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<CaptchaResponse> {
        if !request.is_method("POST") {
            return Ok(CaptchaResponse::bad_request());
        }
        let Some(payload) = request.field(PAYLOAD_FIELD).and_then(Payload::decode) else {
            tracing::debug!("Undecodable payload");
            return Ok(CaptchaResponse::bad_request());
        };
        if let Err(code) = payload.check(self.clock.now_millis()) {
            tracing::debug!(action = ?payload.action, error = %code, "Payload rejected");
            return Ok(CaptchaResponse::bad_request());
        }

        if self.options.token.enabled {
            let header = request.header(&self.options.token.header);
            // Only the initial load may omit the header.
            let header = match payload.action {
                Action::Load => header,
                _ => Some(header.unwrap_or_default()),
            };
            if !SessionToken::new(session).validate(payload.token.as_deref(), header)? {
                tracing::warn!(widget_id = %payload.widget_id, "Invalid form token");
                return CaptchaResponse::error(ErrorCode::InvalidFormToken);
            }
        }

        match payload.action {
            Action::Load => self.load(&payload, request, session),
            Action::Selection => self.selection(&payload, request, session),
            Action::Invalidate => self.invalidate(&payload, request, session),
        }
    }

    fn timeout_response(remaining: i64) -> Result<CaptchaResponse> {
        Ok(CaptchaResponse::ok(encode_body(&ErrorBody {
            error: ErrorCode::TooManyAttempts,
            data: Some(remaining),
        })?))
    }

    fn load(
        &self,
        payload: &Payload,
        request: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<CaptchaResponse> {
        let theme = payload.theme.as_deref().unwrap_or(FALLBACK_THEME);
        let mut rng = self.request_rng()?;

        self.with_challenge(
            session,
            &request.visitor,
            &payload.widget_id,
            payload.challenge_id.as_deref(),
            |mut challenge| {
                if let LoadOutcome::Timeout { remaining } = challenge.generate(&mut rng, theme)? {
                    return Self::timeout_response(remaining);
                }
                let image = match challenge.render(&self.compositor, &mut rng)? {
                    RenderOutcome::Image(png) => general_purpose::STANDARD.encode(png),
                    RenderOutcome::Rejected(code) => return CaptchaResponse::error(code),
                };

                let challenge_session = challenge.session();
                let body = LoadResponse {
                    identifier: challenge_session.challenge_id().to_string(),
                    challenge: image,
                    expired_at: challenge_session.data().expires_at,
                    timestamp: challenge_session.now(),
                };
                Ok(CaptchaResponse::ok(encode_body(&body)?))
            },
        )
    }

    fn selection(
        &self,
        payload: &Payload,
        request: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<CaptchaResponse> {
        let (Some(challenge_id), Some(x), Some(y), Some(width)) =
            (payload.challenge_id.as_deref(), payload.x, payload.y, payload.width)
        else {
            return Ok(CaptchaResponse::bad_request());
        };

        self.with_challenge(
            session,
            &request.visitor,
            &payload.widget_id,
            Some(challenge_id),
            |mut challenge| match challenge.select(x, y, width)? {
                SelectionOutcome::Correct | SelectionOutcome::Incorrect => {
                    let challenge_session = challenge.session();
                    let body = SelectionResponse {
                        identifier: challenge_session.challenge_id().to_string(),
                        completed: challenge_session.data().completed,
                        expired_at: challenge_session.data().expires_at,
                    };
                    Ok(CaptchaResponse::ok(encode_body(&body)?))
                }
                SelectionOutcome::Timeout { remaining } => Self::timeout_response(remaining),
                SelectionOutcome::Rejected(code) => CaptchaResponse::error(code),
            },
        )
    }

    fn invalidate(
        &self,
        payload: &Payload,
        request: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<CaptchaResponse> {
        let Some(challenge_id) = payload.challenge_id.as_deref() else {
            return Ok(CaptchaResponse::bad_request());
        };
        self.with_challenge(
            session,
            &request.visitor,
            &payload.widget_id,
            Some(challenge_id),
            |challenge| {
                if !challenge.session().is_new() {
                    challenge.invalidate()?;
                }
                Ok(CaptchaResponse::empty(200))
            },
        )
    }

    /// Validate a submitted form protected by the captcha.
    ///
    /// On success the challenge is destroyed, so every solved challenge
    /// validates exactly once.
    pub fn validate(
        &self,
        form: &CaptchaRequest,
        session: &dyn KeyValueStore,
    ) -> Result<ValidationResult> {
        let fields = &self.options.validation;

        if self.options.token.enabled {
            let token = form.field(&self.options.token.field);
            if !SessionToken::new(session).validate(token, None)? {
                tracing::warn!("Form submitted with invalid token");
                return Ok(ValidationResult::failure(ErrorCode::InvalidFormToken));
            }
        }

        let widget_id = form.field(&fields.widget_field).filter(|v| !v.is_empty());
        let challenge_id = form.field(&fields.challenge_field).filter(|v| !v.is_empty());
        let honeypot = form.field(&fields.honeypot_field);
        let (Some(widget_id), Some(challenge_id), Some(honeypot)) = (widget_id, challenge_id, honeypot)
        else {
            return Ok(ValidationResult::failure(ErrorCode::EmptyForm));
        };
        if !honeypot.is_empty() {
            tracing::warn!(widget_id, "Honeypot field filled in");
            return Ok(ValidationResult::failure(ErrorCode::Honeypot));
        }
        if !is_uuid_v4(widget_id) || !is_uuid_v4(challenge_id) {
            return Ok(ValidationResult::failure(ErrorCode::InvalidChallenge));
        }

        let widget_key = storage_key(&[KEY_ROOT, "challenges", widget_id]);
        self.locks.with_lock(&widget_key, || {
            let (sessions, attempts) = self.backends(session);
            // No purge here, so expired challenges report as such.
            let settings = SessionSettings {
                purging: false,
                ..self.session_settings()
            };
            let challenge_session = ChallengeSession::load(
                sessions.as_ref(),
                self.clock.as_ref(),
                settings,
                widget_id,
                Some(challenge_id),
            )?;

            let data = challenge_session.data();
            let failure = if challenge_session.is_new() || !data.requested {
                Some(ErrorCode::InvalidChallenge)
            } else if challenge_session.is_expired() {
                Some(ErrorCode::ExpiredChallenge)
            } else if !data.completed {
                Some(ErrorCode::UnsolvedChallenge)
            } else {
                None
            };
            if let Some(code) = failure {
                tracing::info!(widget_id, challenge_id, error = %code, "Validation failed");
                return Ok(ValidationResult::failure(code));
            }

            challenge_session.destroy()?;
            AttemptsTracker::new(
                attempts.as_ref(),
                self.clock.as_ref(),
                &self.options.attempts,
                &form.visitor,
            )
            .clear_attempts()?;
            self.hooks.on_validated(widget_id, challenge_id);
            tracing::info!(widget_id, challenge_id, "Captcha validated");
            Ok(ValidationResult::success())
        })?
    }
}

impl std::fmt::Debug for IconCaptcha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IconCaptcha")
            .field("driver", &self.driver)
            .field("pool", &self.pool)
            .field("cors", &self.cors)
            .finish()
    }
}
