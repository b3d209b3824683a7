//! Relational connections.

use super::query::{validate_table_name, Dialect, QueryStrategy};
use crate::error::{CaptchaError, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Parameter and column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Text(s) => s.parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// Minimal connection contract the relational storage needs.
///
/// Parameters are positional, in the order documented on
/// [`QueryStrategy`](super::QueryStrategy).
pub trait SqlConnection: Send {
    /// Run a statement, returning affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Fetch the first row, if any.
    fn query_row(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<SqlValue>>>;

    /// Run several statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> Result<()>;
}

/// SQLite connection through rusqlite.
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Open or create a database file. The parent directory must exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        check_sqlite_path(path)?;
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }
}

/// Fail when the database file could never be created.
pub fn check_sqlite_path(path: &Path) -> Result<()> {
    if path.as_os_str() == ":memory:" {
        return Ok(());
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(CaptchaError::Config(format!(
                "SQLite directory does not exist: {}",
                parent.display()
            )))
        }
        _ => Ok(()),
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(v),
        Value::Real(v) => SqlValue::Integer(v as i64),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

impl SqlConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let affected = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(to_value)))?;
        Ok(affected)
    }

    fn query_row(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<SqlValue>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_value)))?;

        match rows.next()? {
            Some(row) => {
                let mut values = Vec::with_capacity(columns);
                for idx in 0..columns {
                    let value: Value = row.get(idx)?;
                    values.push(from_value(value));
                }
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Opens a connection on demand.
pub type ConnectionFactory = Box<dyn Fn() -> Result<Box<dyn SqlConnection>> + Send + Sync>;

/// Lazily opened, memoized connection shared by every request of an engine.
///
/// Tables are created the first time the connection is opened.
pub struct ConnectionPool {
    factory: ConnectionFactory,
    strategy: Box<dyn QueryStrategy>,
    challenge_table: String,
    attempts_table: String,
    conn: Mutex<Option<Box<dyn SqlConnection>>>,
}

impl ConnectionPool {
    pub fn new(
        factory: ConnectionFactory,
        dialect: Dialect,
        challenge_table: impl Into<String>,
        attempts_table: impl Into<String>,
    ) -> Result<Self> {
        Self::with_strategy(factory, dialect.strategy(), challenge_table, attempts_table)
    }

    pub fn with_strategy(
        factory: ConnectionFactory,
        strategy: Box<dyn QueryStrategy>,
        challenge_table: impl Into<String>,
        attempts_table: impl Into<String>,
    ) -> Result<Self> {
        let challenge_table = challenge_table.into();
        let attempts_table = attempts_table.into();
        validate_table_name(&challenge_table)?;
        validate_table_name(&attempts_table)?;

        Ok(Self {
            factory,
            strategy,
            challenge_table,
            attempts_table,
            conn: Mutex::new(None),
        })
    }

    /// Pool over a SQLite file.
    pub fn sqlite(
        path: impl Into<PathBuf>,
        challenge_table: impl Into<String>,
        attempts_table: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        check_sqlite_path(&path)?;
        let factory: ConnectionFactory = Box::new(move || {
            let conn: Box<dyn SqlConnection> = if path.as_os_str() == ":memory:" {
                Box::new(SqliteConnection::in_memory()?)
            } else {
                Box::new(SqliteConnection::open(&path)?)
            };
            Ok(conn)
        });
        Self::new(factory, Dialect::Sqlite, challenge_table, attempts_table)
    }

    pub fn strategy(&self) -> &dyn QueryStrategy {
        self.strategy.as_ref()
    }

    pub fn challenge_table(&self) -> &str {
        &self.challenge_table
    }

    pub fn attempts_table(&self) -> &str {
        &self.attempts_table
    }

    /// Run `f` on the shared connection, opening it first if needed.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn SqlConnection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock()?;
        if guard.is_none() {
            let mut conn = (self.factory)()?;
            conn.execute_batch(
                &self
                    .strategy
                    .create_tables(&self.challenge_table, &self.attempts_table),
            )?;
            tracing::debug!(
                challenge_table = %self.challenge_table,
                attempts_table = %self.attempts_table,
                "Opened storage connection"
            );
            *guard = Some(conn);
        }

        match guard.as_mut() {
            Some(conn) => f(conn.as_mut()),
            None => Err(CaptchaError::Storage("connection unavailable".into())),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("challenge_table", &self.challenge_table)
            .field("attempts_table", &self.attempts_table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sqlite_roundtrip() {
        let mut conn = SqliteConnection::in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY, v INTEGER)")
            .unwrap();
        let n = conn
            .execute("INSERT INTO t (k, v) VALUES (?, ?)", &["a".into(), SqlValue::Integer(7)])
            .unwrap();
        assert_eq!(n, 1);

        let row = conn
            .query_row("SELECT k, v FROM t WHERE k = ?", &["a".into()])
            .unwrap()
            .unwrap();
        assert_eq!(row, vec![SqlValue::Text("a".into()), SqlValue::Integer(7)]);

        let missing = conn
            .query_row("SELECT k FROM t WHERE k = ?", &["b".into()])
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_missing_sqlite_directory() {
        let err = ConnectionPool::sqlite("/definitely/not/here/captcha.db", "c", "a").unwrap_err();
        assert!(matches!(err, CaptchaError::Config(_)));
    }

    #[test]
    fn test_pool_opens_once_and_creates_tables() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let factory: ConnectionFactory = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SqliteConnection::in_memory()?) as Box<dyn SqlConnection>)
        });
        let pool = ConnectionPool::new(factory, Dialect::Sqlite, "challenges", "attempts").unwrap();

        for _ in 0..3 {
            pool.with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM challenges", &[])?;
                conn.query_row("SELECT COUNT(*) FROM attempts", &[])?;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_rejects_bad_table() {
        let factory: ConnectionFactory =
            Box::new(|| Ok(Box::new(SqliteConnection::in_memory()?) as Box<dyn SqlConnection>));
        let err = ConnectionPool::new(factory, Dialect::Sqlite, "bad name", "attempts").unwrap_err();
        assert!(matches!(err, CaptchaError::Config(_)));
    }
}
