//! Challenge lifecycle for a single request.
//!
//! A [`Challenge`] ties one loaded [`ChallengeSession`] to the visitor's
//! [`AttemptsTracker`] and runs the generate / render / select transitions
//! on it. Business outcomes come back as enums; only faults are errors.

use crate::attempts::{secs_to_millis, AttemptsTracker};
use crate::compositor::{Compositor, ImageBackend};
use crate::config::{CaptchaOptions, FALLBACK_THEME};
use crate::error::{ErrorCode, Result};
use crate::generator::generate_layout;
use crate::hooks::ChallengeHooks;
use crate::resolver::determine_clicked_icon;
use crate::session::ChallengeSession;
use rand::Rng;

/// Result of [`Challenge::generate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A new layout was stored.
    Generated,
    /// The visitor is timed out for `remaining` more milliseconds.
    Timeout { remaining: i64 },
}

/// Result of [`Challenge::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// PNG bytes.
    Image(Vec<u8>),
    Rejected(ErrorCode),
}

/// Result of [`Challenge::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOutcome {
    Correct,
    Incorrect,
    Timeout { remaining: i64 },
    Rejected(ErrorCode),
}

/// Expiry timestamp `secs` from `now`, or 0 when `secs` is 0.
fn expiry(now: i64, secs: u64) -> i64 {
    if secs == 0 {
        0
    } else {
        now.saturating_add(secs_to_millis(secs))
    }
}

pub struct Challenge<'a> {
    options: &'a CaptchaOptions,
    session: ChallengeSession<'a>,
    tracker: AttemptsTracker<'a>,
    hooks: &'a dyn ChallengeHooks,
}

impl<'a> Challenge<'a> {
    pub fn new(
        options: &'a CaptchaOptions,
        session: ChallengeSession<'a>,
        tracker: AttemptsTracker<'a>,
        hooks: &'a dyn ChallengeHooks,
    ) -> Self {
        Self {
            options,
            session,
            tracker,
            hooks,
        }
    }

    pub fn session(&self) -> &ChallengeSession<'a> {
        &self.session
    }

    pub fn into_session(self) -> ChallengeSession<'a> {
        self.session
    }

    /// Remaining timeout in ms, if one is active.
    ///
    /// Timeouts that already lapsed are cleared on the way, both in the
    /// tracker and in the session.
    fn active_timeout(&mut self) -> Result<Option<i64>> {
        if self.tracker.is_enabled() {
            let remaining = self.tracker.timeout_remaining_time()?;
            if remaining > 0 {
                return Ok(Some(remaining));
            }
            if self.tracker.has_timeout()? {
                self.tracker.clear_attempts()?;
            }
        }

        let now = self.session.now();
        let data = self.session.data_mut();
        if data.attempts_timeout > now {
            return Ok(Some(data.attempts_timeout - now));
        }
        if data.attempts_timeout > 0 {
            data.attempts_timeout = 0;
            data.attempts = 0;
        }
        Ok(None)
    }

    /// Replace the session's layout with a freshly generated one.
    ///
    /// The attempts counter survives the regeneration. While a timeout is
    /// active nothing is written.
    pub fn generate<R: Rng + ?Sized>(&mut self, rng: &mut R, theme: &str) -> Result<LoadOutcome> {
        if let Some(remaining) = self.active_timeout()? {
            tracing::info!(
                widget_id = %self.session.widget_id(),
                remaining,
                "Generation refused during timeout"
            );
            return Ok(LoadOutcome::Timeout { remaining });
        }

        let theme = if self.options.has_theme(theme) {
            theme
        } else {
            FALLBACK_THEME
        };
        let layout = generate_layout(rng, &self.options.challenge);
        let attempts = self.session.data().attempts;
        let now = self.session.now();

        self.session.clear();
        let data = self.session.data_mut();
        data.icons = layout.icons;
        data.icon_ids = layout.icon_ids;
        data.correct_id = layout.correct_id;
        data.mode = theme.to_string();
        data.requested = false;
        data.completed = false;
        data.attempts = attempts;
        data.expires_at = expiry(now, self.options.challenge.expiration.inactivity);
        self.session.save()?;

        tracing::info!(
            widget_id = %self.session.widget_id(),
            challenge_id = %self.session.challenge_id(),
            icon_amount = self.session.data().icon_amount(),
            theme,
            "Challenge generated"
        );
        self.hooks
            .on_generate(self.session.widget_id(), self.session.challenge_id());
        Ok(LoadOutcome::Generated)
    }

    /// Draw the challenge image. Works once per generated layout.
    pub fn render<B: ImageBackend, R: Rng + ?Sized>(
        &mut self,
        compositor: &Compositor<B>,
        rng: &mut R,
    ) -> Result<RenderOutcome> {
        if self.session.is_new() || self.session.data().icons.is_empty() {
            return Ok(RenderOutcome::Rejected(ErrorCode::InvalidChallenge));
        }
        if self.session.data().requested {
            tracing::warn!(
                challenge_id = %self.session.challenge_id(),
                "Challenge image requested twice"
            );
            return Ok(RenderOutcome::Rejected(ErrorCode::ChallengeRequested));
        }
        if self.session.is_expired() {
            return Ok(RenderOutcome::Rejected(ErrorCode::ExpiredChallenge));
        }

        self.session.data_mut().requested = true;
        self.session.save()?;

        let data = self.session.data();
        let theme = self.options.theme(&data.mode);
        let icon_dir = self.options.icon_path.join(&theme.icons);
        let canvas = compositor.generate(
            rng,
            &icon_dir,
            self.options.placeholder.as_deref(),
            &data.icons,
            theme.border_color(),
        )?;
        let png = compositor.render(&canvas)?;

        tracing::debug!(
            challenge_id = %self.session.challenge_id(),
            bytes = png.len(),
            "Challenge rendered"
        );
        Ok(RenderOutcome::Image(png))
    }

    /// Process a click after checking the challenge can take one.
    pub fn select(&mut self, x: f64, y: f64, width: f64) -> Result<SelectionOutcome> {
        let data = self.session.data();
        if self.session.is_new() || data.icons.is_empty() || !data.requested || data.completed {
            return Ok(SelectionOutcome::Rejected(ErrorCode::InvalidChallenge));
        }
        if self.session.is_expired() {
            return Ok(SelectionOutcome::Rejected(ErrorCode::ExpiredChallenge));
        }
        if let Some(remaining) = self.active_timeout()? {
            return Ok(SelectionOutcome::Timeout { remaining });
        }

        Ok(if self.make_selection(x, y, width)? {
            SelectionOutcome::Correct
        } else {
            SelectionOutcome::Incorrect
        })
    }

    /// Resolve a click against the layout and record the outcome.
    pub fn make_selection(&mut self, x: f64, y: f64, width: f64) -> Result<bool> {
        let now = self.session.now();
        let data = self.session.data();
        let clicked = determine_clicked_icon(x, y, width, data.icon_amount())
            .and_then(|position| data.icons.get(&position).copied());
        let correct = clicked == Some(data.correct_id);

        if correct {
            self.tracker.clear_attempts()?;
            let data = self.session.data_mut();
            data.completed = true;
            data.attempts = 0;
            data.attempts_timeout = 0;
            data.expires_at = expiry(now, self.options.challenge.expiration.completion);
            self.session.save()?;
            tracing::info!(
                widget_id = %self.session.widget_id(),
                challenge_id = %self.session.challenge_id(),
                "Correct icon selected"
            );
        } else {
            if self.tracker.is_enabled() {
                self.tracker.increase_attempts()?;
            }
            let attempts = &self.options.attempts;
            let data = self.session.data_mut();
            data.completed = false;
            data.attempts += 1;
            if attempts.enabled && attempts.timeout > 0 && data.attempts == attempts.amount {
                data.attempts_timeout = now.saturating_add(secs_to_millis(attempts.timeout));
            }
            let count = data.attempts;
            self.session.save()?;
            tracing::info!(
                widget_id = %self.session.widget_id(),
                challenge_id = %self.session.challenge_id(),
                attempts = count,
                "Incorrect icon selected"
            );
        }

        self.hooks.on_selection(
            self.session.widget_id(),
            self.session.challenge_id(),
            correct,
        );
        Ok(correct)
    }

    /// Drop the challenge, e.g. when the widget was abandoned.
    pub fn invalidate(self) -> Result<()> {
        tracing::debug!(
            widget_id = %self.session.widget_id(),
            challenge_id = %self.session.challenge_id(),
            "Challenge invalidated"
        );
        self.session.destroy()
    }
}
