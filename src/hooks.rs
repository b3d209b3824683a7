//! Host callbacks fired on challenge state transitions.

/// Observer for challenge events. Every method defaults to a no-op.
///
/// Hooks run inside the per-widget lock; keep them short.
pub trait ChallengeHooks: Send + Sync {
    /// A new layout was generated.
    fn on_generate(&self, _widget_id: &str, _challenge_id: &str) {}

    /// A selection was processed.
    fn on_selection(&self, _widget_id: &str, _challenge_id: &str, _correct: bool) {}

    /// A completed challenge passed form validation.
    fn on_validated(&self, _widget_id: &str, _challenge_id: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ChallengeHooks for NoopHooks {}

#[cfg(test)]
pub(crate) mod recording {
    use super::ChallengeHooks;
    use std::sync::Mutex;

    /// Collects every event as a string.
    #[derive(Debug, Default)]
    pub struct RecordingHooks {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ChallengeHooks for RecordingHooks {
        fn on_generate(&self, _widget_id: &str, _challenge_id: &str) {
            self.events.lock().unwrap().push("generate".into());
        }

        fn on_selection(&self, _widget_id: &str, _challenge_id: &str, correct: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("selection:{}", correct));
        }

        fn on_validated(&self, _widget_id: &str, _challenge_id: &str) {
            self.events.lock().unwrap().push("validated".into());
        }
    }
}
