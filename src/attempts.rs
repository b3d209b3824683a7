//! Failed-attempt counting and timeouts per visitor.
//!
//! A visitor is identified by its IP address or a host-chosen identifier.
//! Only the SHA-256 of that identifier is stored.
//!
//! Records older than their `valid_until` are treated as absent: a visitor
//! who stays idle long enough gets a fresh counter even without ever hitting
//! the timeout.

use crate::clock::Clock;
use crate::config::AttemptsOptions;
use crate::error::Result;
use crate::storage::{storage_key, ConnectionPool, KeyValueStore, SqlValue, KEY_ROOT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const ATTEMPTS_SEGMENT: &str = "attempts";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptsRecord {
    pub count: u32,
    /// Unix ms after which the record is stale.
    pub valid_until: i64,
    /// Unix ms until which selections are rejected, 0 for none.
    pub timeout_until: i64,
}

impl AttemptsRecord {
    pub fn is_stale(&self, now: i64) -> bool {
        self.valid_until <= now
    }
}

/// Hash a visitor identifier into its storage form.
pub fn visitor_key(visitor: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(visitor.as_bytes());
    hex::encode(hasher.finalize())
}

/// Storage for attempt records keyed by hashed visitor.
pub trait AttemptsBackend {
    fn read(&self, visitor: &str) -> Result<Option<AttemptsRecord>>;

    fn write(&self, visitor: &str, record: &AttemptsRecord) -> Result<()>;

    fn remove(&self, visitor: &str) -> Result<()>;

    fn purge_expired(&self, now: i64) -> Result<usize>;
}

pub struct KeyValueAttempts<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> KeyValueAttempts<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    fn key(visitor: &str) -> String {
        storage_key(&[KEY_ROOT, ATTEMPTS_SEGMENT, visitor])
    }
}

impl AttemptsBackend for KeyValueAttempts<'_> {
    fn read(&self, visitor: &str) -> Result<Option<AttemptsRecord>> {
        match self.store.read(&Self::key(visitor))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write(&self, visitor: &str, record: &AttemptsRecord) -> Result<()> {
        self.store
            .write(&Self::key(visitor), &serde_json::to_string(record)?)
    }

    fn remove(&self, visitor: &str) -> Result<()> {
        self.store.remove(&Self::key(visitor))
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let prefix = format!("{}.", storage_key(&[KEY_ROOT, ATTEMPTS_SEGMENT]));
        let mut purged = 0;
        for key in self.store.keys(&prefix)? {
            let stale = match self.store.read(&key)? {
                Some(raw) => serde_json::from_str::<AttemptsRecord>(&raw)
                    .map(|r| r.is_stale(now))
                    .unwrap_or(true),
                None => false,
            };
            if stale {
                self.store.remove(&key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

pub struct SqlAttempts<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> SqlAttempts<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool }
    }
}

impl AttemptsBackend for SqlAttempts<'_> {
    fn read(&self, visitor: &str) -> Result<Option<AttemptsRecord>> {
        let sql = self.pool.strategy().attempts_load(self.pool.attempts_table());
        let row = self
            .pool
            .with_connection(|conn| conn.query_row(&sql, &[visitor.into()]))?;

        Ok(row.map(|values| {
            let get = |idx: usize| values.get(idx).and_then(SqlValue::as_i64).unwrap_or(0);
            AttemptsRecord {
                count: get(0).max(0) as u32,
                valid_until: get(1),
                timeout_until: get(2),
            }
        }))
    }

    fn write(&self, visitor: &str, record: &AttemptsRecord) -> Result<()> {
        let sql = self.pool.strategy().attempts_upsert(self.pool.attempts_table());
        self.pool.with_connection(|conn| {
            conn.execute(
                &sql,
                &[
                    visitor.into(),
                    i64::from(record.count).into(),
                    record.valid_until.into(),
                    record.timeout_until.into(),
                ],
            )
        })?;
        Ok(())
    }

    fn remove(&self, visitor: &str) -> Result<()> {
        let sql = self.pool.strategy().attempts_delete(self.pool.attempts_table());
        self.pool
            .with_connection(|conn| conn.execute(&sql, &[visitor.into()]))?;
        Ok(())
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let sql = self.pool.strategy().attempts_purge(self.pool.attempts_table());
        self.pool.with_connection(|conn| conn.execute(&sql, &[now.into()]))
    }
}

/// Attempt bookkeeping for one visitor during one request.
pub struct AttemptsTracker<'a> {
    backend: &'a dyn AttemptsBackend,
    clock: &'a dyn Clock,
    options: &'a AttemptsOptions,
    visitor: String,
}

impl<'a> AttemptsTracker<'a> {
    /// `visitor` is the raw identifier; it is hashed here.
    pub fn new(
        backend: &'a dyn AttemptsBackend,
        clock: &'a dyn Clock,
        options: &'a AttemptsOptions,
        visitor: &str,
    ) -> Self {
        Self {
            backend,
            clock,
            options,
            visitor: visitor_key(visitor),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled && self.options.timeout > 0
    }

    /// The live record, or `None` once its validity window has passed.
    pub fn current(&self) -> Result<Option<AttemptsRecord>> {
        let now = self.clock.now_millis();
        Ok(self.backend.read(&self.visitor)?.filter(|r| !r.is_stale(now)))
    }

    pub fn is_timeout_active(&self) -> Result<bool> {
        Ok(self.timeout_remaining_time()? > 0)
    }

    /// Whether a timeout was issued at some point, active or not.
    pub fn has_timeout(&self) -> Result<bool> {
        Ok(self
            .backend
            .read(&self.visitor)?
            .map(|r| r.timeout_until > 0)
            .unwrap_or(false))
    }

    /// Milliseconds until the timeout lifts, 0 when there is none.
    pub fn timeout_remaining_time(&self) -> Result<i64> {
        let now = self.clock.now_millis();
        Ok(self
            .backend
            .read(&self.visitor)?
            .filter(|r| r.timeout_until > 0)
            .map(|r| (r.timeout_until - now).max(0))
            .unwrap_or(0))
    }

    /// Count one failed attempt. Returns true when this issued a timeout.
    pub fn increase_attempts(&self) -> Result<bool> {
        let now = self.clock.now_millis();
        let count = self.current()?.map(|r| r.count).unwrap_or(0) + 1;

        if count >= self.options.amount {
            let timeout_until = now + secs_to_millis(self.options.timeout);
            // The record expires together with the timeout.
            self.backend.write(
                &self.visitor,
                &AttemptsRecord {
                    count,
                    valid_until: timeout_until,
                    timeout_until,
                },
            )?;
            tracing::warn!(attempts = count, timeout_until, "Attempts timeout issued");
            return Ok(true);
        }

        self.backend.write(
            &self.visitor,
            &AttemptsRecord {
                count,
                valid_until: now + secs_to_millis(self.options.valid),
                timeout_until: 0,
            },
        )?;
        tracing::debug!(attempts = count, "Failed attempt recorded");
        Ok(false)
    }

    pub fn clear_attempts(&self) -> Result<()> {
        self.backend.remove(&self.visitor)
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.backend.purge_expired(self.clock.now_millis())
    }
}

pub(crate) fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}
