//! Persistence backends.
//!
//! Two families exist:
//!
//! - [`KeyValueStore`]: hierarchical dot-separated keys holding JSON strings.
//!   This is the visitor session in a web host; [`MemoryStore`] is the
//!   in-process implementation.
//! - Relational storage through [`sql::ConnectionPool`] and a per-dialect
//!   [`query::QueryStrategy`].
//!
//! Challenge sessions and attempt records pick one of these through
//! [`StorageDriver`].

pub mod query;
pub mod sql;

use crate::error::{CaptchaError, Result};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub use query::{Dialect, QueryStrategy};
pub use sql::{ConnectionPool, SqlConnection, SqlValue, SqliteConnection};

/// Root segment of every key written by this crate.
pub const KEY_ROOT: &str = "iconcaptcha";

/// Join key segments with dots.
pub fn storage_key(segments: &[&str]) -> String {
    segments.join(".")
}

/// String key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;

    fn write(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// All keys starting with `prefix`. Used by expiry sweeps.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock()?.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock()?.contains_key(key))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Where challenge sessions and attempt records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    /// Visitor key-value session
    Session,
    MySql,
    Postgres,
    Sqlite,
    SqlServer,
    /// Host-supplied SQL connection with a host-chosen dialect
    Custom,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Session => "session",
            StorageDriver::MySql => "mysql",
            StorageDriver::Postgres => "pgsql",
            StorageDriver::Sqlite => "sqlite",
            StorageDriver::SqlServer => "sqlsrv",
            StorageDriver::Custom => "custom",
        }
    }

    /// SQL dialect for relational drivers.
    pub fn dialect(&self) -> Option<Dialect> {
        match self {
            StorageDriver::MySql => Some(Dialect::MySql),
            StorageDriver::Postgres => Some(Dialect::Postgres),
            StorageDriver::Sqlite => Some(Dialect::Sqlite),
            StorageDriver::SqlServer => Some(Dialect::SqlServer),
            StorageDriver::Session | StorageDriver::Custom => None,
        }
    }
}

impl FromStr for StorageDriver {
    type Err = CaptchaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "session" => Ok(StorageDriver::Session),
            "mysql" | "mariadb" => Ok(StorageDriver::MySql),
            "pgsql" | "postgres" | "postgresql" => Ok(StorageDriver::Postgres),
            "sqlite" => Ok(StorageDriver::Sqlite),
            "sqlsrv" | "mssql" => Ok(StorageDriver::SqlServer),
            "custom" => Ok(StorageDriver::Custom),
            other => Err(CaptchaError::UnsupportedDriver(other.to_string())),
        }
    }
}

impl std::fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-key mutual exclusion for read-modify-write sequences.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock()?;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = lock.lock()?;
            f()
        };

        // Drop entries nobody else is waiting on.
        let mut locks = self.locks.lock()?;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new();
        assert!(!store.exists("a.b").unwrap());

        store.write("a.b", "1").unwrap();
        assert_eq!(store.read("a.b").unwrap().as_deref(), Some("1"));
        assert!(store.exists("a.b").unwrap());

        store.write("a.b", "2").unwrap();
        assert_eq!(store.read("a.b").unwrap().as_deref(), Some("2"));

        store.remove("a.b").unwrap();
        assert!(store.read("a.b").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_prefix_scan() {
        let store = MemoryStore::new();
        store.write("iconcaptcha.challenges.w1.c1", "x").unwrap();
        store.write("iconcaptcha.challenges.w2.c1", "x").unwrap();
        store.write("iconcaptcha.attempts.abc", "x").unwrap();
        store.write("other", "x").unwrap();

        let keys = store.keys("iconcaptcha.challenges.").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("iconcaptcha.challenges.")));
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(storage_key(&[KEY_ROOT, "token"]), "iconcaptcha.token");
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!("session".parse::<StorageDriver>().unwrap(), StorageDriver::Session);
        assert_eq!("postgres".parse::<StorageDriver>().unwrap(), StorageDriver::Postgres);
        assert_eq!("PGSQL".parse::<StorageDriver>().unwrap(), StorageDriver::Postgres);
        assert_eq!("mssql".parse::<StorageDriver>().unwrap(), StorageDriver::SqlServer);
        assert_eq!(StorageDriver::Sqlite.dialect(), Some(Dialect::Sqlite));
        assert!(StorageDriver::Session.dialect().is_none());
        assert!(matches!(
            "mongo".parse::<StorageDriver>(),
            Err(CaptchaError::UnsupportedDriver(_))
        ));
    }

    #[test]
    fn test_key_locks_serialize() {
        let locks = Arc::new(KeyLocks::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    locks
                        .with_lock("widget", || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            counter.fetch_add(1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(locks.is_empty());
    }
}
