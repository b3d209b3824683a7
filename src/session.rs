//! Challenge sessions: the persisted state of one generated puzzle.

use crate::clock::Clock;
use crate::error::{CaptchaError, Result};
use crate::storage::{storage_key, ConnectionPool, KeyValueStore, SqlValue, KEY_ROOT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key segment under which challenges are stored in key-value storage.
const CHALLENGES_SEGMENT: &str = "challenges";

/// Persisted puzzle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeData {
    /// Position (1-based) to icon id.
    pub icons: BTreeMap<u32, u32>,
    pub icon_ids: BTreeSet<u32>,
    pub correct_id: u32,
    /// Theme name.
    pub mode: String,
    /// The image was fetched. Set once per generation.
    pub requested: bool,
    /// The correct icon was selected.
    pub completed: bool,
    pub attempts: u32,
    /// Unix ms until which selections are blocked, 0 when inactive.
    pub attempts_timeout: i64,
    /// Unix ms after which the challenge is unusable, 0 for never.
    pub expires_at: i64,
}

impl ChallengeData {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at < now
    }

    pub fn icon_amount(&self) -> u32 {
        self.icons.len() as u32
    }
}

/// Storage for challenge records keyed by `(widget_id, challenge_id)`.
pub trait SessionBackend {
    fn load(&self, widget_id: &str, challenge_id: &str) -> Result<Option<ChallengeData>>;

    /// Insert or replace.
    fn save(&self, widget_id: &str, challenge_id: &str, data: &ChallengeData) -> Result<()>;

    fn remove(&self, widget_id: &str, challenge_id: &str) -> Result<()>;

    fn exists(&self, widget_id: &str, challenge_id: &str) -> Result<bool>;

    /// Delete every record that expired before `now`. Returns how many went.
    fn purge_expired(&self, now: i64) -> Result<usize>;
}

/// Challenges inside a visitor's key-value session.
pub struct KeyValueSessions<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> KeyValueSessions<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    fn key(widget_id: &str, challenge_id: &str) -> String {
        storage_key(&[KEY_ROOT, CHALLENGES_SEGMENT, widget_id, challenge_id])
    }
}

impl SessionBackend for KeyValueSessions<'_> {
    fn load(&self, widget_id: &str, challenge_id: &str) -> Result<Option<ChallengeData>> {
        match self.store.read(&Self::key(widget_id, challenge_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, widget_id: &str, challenge_id: &str, data: &ChallengeData) -> Result<()> {
        let raw = serde_json::to_string(data)?;
        self.store.write(&Self::key(widget_id, challenge_id), &raw)
    }

    fn remove(&self, widget_id: &str, challenge_id: &str) -> Result<()> {
        self.store.remove(&Self::key(widget_id, challenge_id))
    }

    fn exists(&self, widget_id: &str, challenge_id: &str) -> Result<bool> {
        self.store.exists(&Self::key(widget_id, challenge_id))
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let prefix = format!("{}.", storage_key(&[KEY_ROOT, CHALLENGES_SEGMENT]));
        let mut purged = 0;
        for key in self.store.keys(&prefix)? {
            let expired = match self.store.read(&key)? {
                Some(raw) => match serde_json::from_str::<ChallengeData>(&raw) {
                    Ok(data) => data.is_expired(now),
                    // Unreadable records can never be used again.
                    Err(_) => true,
                },
                None => false,
            };
            if expired {
                self.store.remove(&key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Challenges in a relational table.
pub struct SqlSessions<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> SqlSessions<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool }
    }
}

impl SessionBackend for SqlSessions<'_> {
    fn load(&self, widget_id: &str, challenge_id: &str) -> Result<Option<ChallengeData>> {
        let sql = self.pool.strategy().challenge_load(self.pool.challenge_table());
        let row = self.pool.with_connection(|conn| {
            conn.query_row(&sql, &[widget_id.into(), challenge_id.into()])
        })?;

        match row {
            Some(values) => {
                let raw = values
                    .first()
                    .and_then(SqlValue::as_str)
                    .ok_or_else(|| CaptchaError::Storage("challenge row without data".into()))?;
                Ok(Some(serde_json::from_str(raw)?))
            }
            None => Ok(None),
        }
    }

    fn save(&self, widget_id: &str, challenge_id: &str, data: &ChallengeData) -> Result<()> {
        let sql = self.pool.strategy().challenge_upsert(self.pool.challenge_table());
        let raw = serde_json::to_string(data)?;
        self.pool.with_connection(|conn| {
            conn.execute(
                &sql,
                &[
                    widget_id.into(),
                    challenge_id.into(),
                    raw.into(),
                    data.expires_at.into(),
                ],
            )
        })?;
        Ok(())
    }

    fn remove(&self, widget_id: &str, challenge_id: &str) -> Result<()> {
        let sql = self.pool.strategy().challenge_delete(self.pool.challenge_table());
        self.pool.with_connection(|conn| {
            conn.execute(&sql, &[widget_id.into(), challenge_id.into()])
        })?;
        Ok(())
    }

    fn exists(&self, widget_id: &str, challenge_id: &str) -> Result<bool> {
        let sql = self.pool.strategy().challenge_exists(self.pool.challenge_table());
        let row = self.pool.with_connection(|conn| {
            conn.query_row(&sql, &[widget_id.into(), challenge_id.into()])
        })?;
        Ok(row.is_some())
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let sql = self.pool.strategy().challenge_purge(self.pool.challenge_table());
        self.pool.with_connection(|conn| conn.execute(&sql, &[now.into()]))
    }
}

/// Settings that influence [`ChallengeSession::load`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub purging: bool,
    pub identifier_tries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            purging: true,
            identifier_tries: 100,
        }
    }
}

/// One challenge, loaded for the duration of a request.
pub struct ChallengeSession<'a> {
    backend: &'a dyn SessionBackend,
    clock: &'a dyn Clock,
    widget_id: String,
    challenge_id: String,
    data: ChallengeData,
    is_new: bool,
}

impl<'a> ChallengeSession<'a> {
    /// Load the challenge, or start a new one under a fresh identifier.
    ///
    /// Expired records are purged first, so an expired challenge comes back
    /// as a new one.
    pub fn load(
        backend: &'a dyn SessionBackend,
        clock: &'a dyn Clock,
        settings: SessionSettings,
        widget_id: &str,
        challenge_id: Option<&str>,
    ) -> Result<Self> {
        if settings.purging {
            let purged = backend.purge_expired(clock.now_millis())?;
            if purged > 0 {
                tracing::debug!(purged, "Purged expired challenges");
            }
        }

        if let Some(challenge_id) = challenge_id {
            if let Some(data) = backend.load(widget_id, challenge_id)? {
                return Ok(Self {
                    backend,
                    clock,
                    widget_id: widget_id.to_string(),
                    challenge_id: challenge_id.to_string(),
                    data,
                    is_new: false,
                });
            }
        }

        let challenge_id = Self::unique_identifier(backend, widget_id, settings.identifier_tries)?;
        Ok(Self {
            backend,
            clock,
            widget_id: widget_id.to_string(),
            challenge_id,
            data: ChallengeData::default(),
            is_new: true,
        })
    }

    fn unique_identifier(
        backend: &dyn SessionBackend,
        widget_id: &str,
        tries: u32,
    ) -> Result<String> {
        for _ in 0..tries.max(1) {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !backend.exists(widget_id, &candidate)? {
                return Ok(candidate);
            }
        }
        Err(CaptchaError::Storage(format!(
            "No unique challenge identifier found after {} tries",
            tries
        )))
    }

    /// Write the record. Once stored the challenge is no longer new.
    pub fn save(&mut self) -> Result<()> {
        self.backend
            .save(&self.widget_id, &self.challenge_id, &self.data)?;
        self.is_new = false;
        Ok(())
    }

    /// Remove the record from storage.
    pub fn destroy(self) -> Result<()> {
        self.backend.remove(&self.widget_id, &self.challenge_id)
    }

    /// Whether a record exists for the given identifiers.
    pub fn exists(backend: &dyn SessionBackend, challenge_id: &str, widget_id: &str) -> Result<bool> {
        backend.exists(widget_id, challenge_id)
    }

    pub fn is_expired(&self) -> bool {
        self.data.is_expired(self.clock.now_millis())
    }

    /// Reset all puzzle state.
    pub fn clear(&mut self) {
        self.data = ChallengeData::default();
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn challenge_id(&self) -> &str {
        &self.challenge_id
    }

    pub fn data(&self) -> &ChallengeData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ChallengeData {
        &mut self.data
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl std::fmt::Debug for ChallengeSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // correct_id stays out of logs.
        f.debug_struct("ChallengeSession")
            .field("widget_id", &self.widget_id)
            .field("challenge_id", &self.challenge_id)
            .field("is_new", &self.is_new)
            .field("requested", &self.data.requested)
            .field("completed", &self.data.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    const WIDGET: &str = "8f0c4a43-7a0e-4d4e-9a5b-0c8e2f1d3b6a";

    fn sample() -> ChallengeData {
        ChallengeData {
            icons: BTreeMap::from([(1, 10), (2, 20), (3, 10), (4, 20), (5, 30)]),
            icon_ids: BTreeSet::from([10, 20, 30]),
            correct_id: 30,
            mode: "light".into(),
            ..Default::default()
        }
    }

    fn exercise_backend(backend: &dyn SessionBackend) {
        let clock = ManualClock::new(1_000_000);

        let mut session =
            ChallengeSession::load(backend, &clock, SessionSettings::default(), WIDGET, None)
                .unwrap();
        assert!(session.is_new());
        let challenge_id = session.challenge_id().to_string();
        assert!(uuid::Uuid::parse_str(&challenge_id).is_ok());

        *session.data_mut() = sample();
        session.data_mut().expires_at = clock.now_millis() + 60_000;
        session.save().unwrap();
        assert!(!session.is_new());
        assert!(ChallengeSession::exists(backend, &challenge_id, WIDGET).unwrap());

        let loaded = ChallengeSession::load(
            backend,
            &clock,
            SessionSettings::default(),
            WIDGET,
            Some(&challenge_id),
        )
        .unwrap();
        assert!(!loaded.is_new());
        assert_eq!(loaded.data().correct_id, 30);
        assert_eq!(loaded.data().icon_amount(), 5);
        assert!(!loaded.is_expired());

        // Upsert keeps a single record.
        let mut loaded = loaded;
        loaded.data_mut().requested = true;
        loaded.save().unwrap();
        assert!(backend.load(WIDGET, &challenge_id).unwrap().unwrap().requested);

        loaded.destroy().unwrap();
        assert!(!ChallengeSession::exists(backend, &challenge_id, WIDGET).unwrap());
    }

    fn exercise_purge(backend: &dyn SessionBackend) {
        let clock = ManualClock::new(1_000_000);

        let mut expiring = sample();
        expiring.expires_at = 1_000_500;
        backend.save(WIDGET, "expiring", &expiring).unwrap();

        let mut forever = sample();
        forever.expires_at = 0;
        backend.save(WIDGET, "forever", &forever).unwrap();

        clock.advance(1_000);
        let session = ChallengeSession::load(
            backend,
            &clock,
            SessionSettings::default(),
            WIDGET,
            Some("expiring"),
        )
        .unwrap();
        assert!(session.is_new());
        assert_ne!(session.challenge_id(), "expiring");
        assert!(!backend.exists(WIDGET, "expiring").unwrap());
        assert!(backend.exists(WIDGET, "forever").unwrap());
    }

    #[test]
    fn test_key_value_backend() {
        let store = MemoryStore::new();
        exercise_backend(&KeyValueSessions::new(&store));
    }

    #[test]
    fn test_key_value_purge() {
        let store = MemoryStore::new();
        exercise_purge(&KeyValueSessions::new(&store));
    }

    #[test]
    fn test_key_value_layout() {
        let store = MemoryStore::new();
        let backend = KeyValueSessions::new(&store);
        backend.save(WIDGET, "c1", &sample()).unwrap();
        let key = format!("iconcaptcha.challenges.{}.c1", WIDGET);
        assert!(store.exists(&key).unwrap());
    }

    #[test]
    fn test_sql_backend() {
        let pool = ConnectionPool::sqlite(":memory:", "challenges", "attempts").unwrap();
        exercise_backend(&SqlSessions::new(&pool));
    }

    #[test]
    fn test_sql_purge() {
        let pool = ConnectionPool::sqlite(":memory:", "challenges", "attempts").unwrap();
        exercise_purge(&SqlSessions::new(&pool));
    }

    #[test]
    fn test_sql_backend_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captcha.db");
        {
            let pool = ConnectionPool::sqlite(&path, "challenges", "attempts").unwrap();
            SqlSessions::new(&pool).save(WIDGET, "c1", &sample()).unwrap();
        }
        let pool = ConnectionPool::sqlite(&path, "challenges", "attempts").unwrap();
        let loaded = SqlSessions::new(&pool).load(WIDGET, "c1").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_expiry_rule() {
        let mut data = sample();
        data.expires_at = 0;
        assert!(!data.is_expired(i64::MAX));
        data.expires_at = 100;
        assert!(!data.is_expired(100));
        assert!(data.is_expired(101));
    }
}
