//! SQL templates per database dialect.
//!
//! Column order is fixed so callers can bind parameters positionally:
//!
//! | query              | parameters                                         |
//! |--------------------|----------------------------------------------------|
//! | `challenge_load`   | widget_id, challenge_id                            |
//! | `challenge_upsert` | widget_id, challenge_id, data, expires_at          |
//! | `challenge_delete` | widget_id, challenge_id                            |
//! | `challenge_exists` | widget_id, challenge_id                            |
//! | `challenge_purge`  | now                                                |
//! | `attempts_load`    | visitor                                            |
//! | `attempts_upsert`  | visitor, attempts, valid_until, timeout_until      |
//! | `attempts_delete`  | visitor                                            |
//! | `attempts_purge`   | now                                                |

use crate::error::{CaptchaError, Result};
use regex::Regex;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
    SqlServer,
}

impl Dialect {
    /// Query strategy for this dialect.
    pub fn strategy(&self) -> Box<dyn QueryStrategy> {
        match self {
            Dialect::MySql => Box::new(MySqlQueries),
            Dialect::Postgres => Box::new(PostgresQueries),
            Dialect::Sqlite => Box::new(SqliteQueries),
            Dialect::SqlServer => Box::new(SqlServerQueries),
        }
    }
}

/// Reject table names that are not plain identifiers, since they are
/// interpolated into the query text.
pub fn validate_table_name(table: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$")?;
    if re.is_match(table) {
        Ok(())
    } else {
        Err(CaptchaError::Config(format!("Invalid table name: {}", table)))
    }
}

/// Produces the query text for every storage operation.
pub trait QueryStrategy: Send + Sync {
    /// Positional placeholder for the 1-based parameter `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// `CREATE TABLE` statements for both tables, idempotent.
    fn create_tables(&self, challenge_table: &str, attempts_table: &str) -> String;

    fn challenge_load(&self, table: &str) -> String {
        format!(
            "SELECT data FROM {} WHERE widget_id = {} AND challenge_id = {}",
            table,
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn challenge_upsert(&self, table: &str) -> String;

    fn challenge_delete(&self, table: &str) -> String {
        format!(
            "DELETE FROM {} WHERE widget_id = {} AND challenge_id = {}",
            table,
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn challenge_exists(&self, table: &str) -> String {
        format!(
            "SELECT 1 FROM {} WHERE widget_id = {} AND challenge_id = {} LIMIT 1",
            table,
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn challenge_purge(&self, table: &str) -> String {
        format!(
            "DELETE FROM {} WHERE expires_at > 0 AND expires_at < {}",
            table,
            self.placeholder(1)
        )
    }

    fn attempts_load(&self, table: &str) -> String {
        format!(
            "SELECT attempts, valid_until, timeout_until FROM {} WHERE visitor = {}",
            table,
            self.placeholder(1)
        )
    }

    fn attempts_upsert(&self, table: &str) -> String;

    fn attempts_delete(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE visitor = {}", table, self.placeholder(1))
    }

    fn attempts_purge(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE valid_until < {}", table, self.placeholder(1))
    }
}

/// Column definitions shared by the dialects that accept `IF NOT EXISTS`.
fn standard_tables(challenge_table: &str, attempts_table: &str, text: &str, int: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {ct} (\
            widget_id VARCHAR(36) NOT NULL, \
            challenge_id VARCHAR(36) NOT NULL, \
            data {text} NOT NULL, \
            expires_at {int} NOT NULL, \
            PRIMARY KEY (widget_id, challenge_id)); \
         CREATE TABLE IF NOT EXISTS {at} (\
            visitor VARCHAR(64) NOT NULL PRIMARY KEY, \
            attempts {int} NOT NULL, \
            valid_until {int} NOT NULL, \
            timeout_until {int} NOT NULL);",
        ct = challenge_table,
        at = attempts_table,
        text = text,
        int = int,
    )
}

pub struct MySqlQueries;

impl QueryStrategy for MySqlQueries {
    fn create_tables(&self, challenge_table: &str, attempts_table: &str) -> String {
        standard_tables(challenge_table, attempts_table, "TEXT", "BIGINT")
    }

    fn challenge_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (widget_id, challenge_id, data, expires_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE data = VALUES(data), expires_at = VALUES(expires_at)",
            table
        )
    }

    fn attempts_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (visitor, attempts, valid_until, timeout_until) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE attempts = VALUES(attempts), \
             valid_until = VALUES(valid_until), timeout_until = VALUES(timeout_until)",
            table
        )
    }
}

pub struct PostgresQueries;

impl QueryStrategy for PostgresQueries {
    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn create_tables(&self, challenge_table: &str, attempts_table: &str) -> String {
        standard_tables(challenge_table, attempts_table, "TEXT", "BIGINT")
    }

    fn challenge_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (widget_id, challenge_id, data, expires_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (widget_id, challenge_id) \
             DO UPDATE SET data = EXCLUDED.data, expires_at = EXCLUDED.expires_at",
            table
        )
    }

    fn attempts_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (visitor, attempts, valid_until, timeout_until) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (visitor) \
             DO UPDATE SET attempts = EXCLUDED.attempts, valid_until = EXCLUDED.valid_until, \
             timeout_until = EXCLUDED.timeout_until",
            table
        )
    }
}

pub struct SqliteQueries;

impl QueryStrategy for SqliteQueries {
    fn create_tables(&self, challenge_table: &str, attempts_table: &str) -> String {
        standard_tables(challenge_table, attempts_table, "TEXT", "INTEGER")
    }

    fn challenge_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (widget_id, challenge_id, data, expires_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(widget_id, challenge_id) \
             DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
            table
        )
    }

    fn attempts_upsert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (visitor, attempts, valid_until, timeout_until) VALUES (?, ?, ?, ?) \
             ON CONFLICT(visitor) \
             DO UPDATE SET attempts = excluded.attempts, valid_until = excluded.valid_until, \
             timeout_until = excluded.timeout_until",
            table
        )
    }
}

pub struct SqlServerQueries;

impl QueryStrategy for SqlServerQueries {
    fn create_tables(&self, challenge_table: &str, attempts_table: &str) -> String {
        format!(
            "IF OBJECT_ID(N'{ct}', N'U') IS NULL CREATE TABLE {ct} (\
                widget_id VARCHAR(36) NOT NULL, \
                challenge_id VARCHAR(36) NOT NULL, \
                data NVARCHAR(MAX) NOT NULL, \
                expires_at BIGINT NOT NULL, \
                PRIMARY KEY (widget_id, challenge_id)); \
             IF OBJECT_ID(N'{at}', N'U') IS NULL CREATE TABLE {at} (\
                visitor VARCHAR(64) NOT NULL PRIMARY KEY, \
                attempts BIGINT NOT NULL, \
                valid_until BIGINT NOT NULL, \
                timeout_until BIGINT NOT NULL);",
            ct = challenge_table,
            at = attempts_table,
        )
    }

    fn challenge_exists(&self, table: &str) -> String {
        format!(
            "SELECT TOP 1 1 FROM {} WHERE widget_id = ? AND challenge_id = ?",
            table
        )
    }

    fn challenge_upsert(&self, table: &str) -> String {
        format!(
            "MERGE INTO {} WITH (HOLDLOCK) AS target \
             USING (SELECT ? AS widget_id, ? AS challenge_id, ? AS data, ? AS expires_at) AS source \
             ON target.widget_id = source.widget_id AND target.challenge_id = source.challenge_id \
             WHEN MATCHED THEN UPDATE SET data = source.data, expires_at = source.expires_at \
             WHEN NOT MATCHED THEN INSERT (widget_id, challenge_id, data, expires_at) \
             VALUES (source.widget_id, source.challenge_id, source.data, source.expires_at);",
            table
        )
    }

    fn attempts_upsert(&self, table: &str) -> String {
        format!(
            "MERGE INTO {} WITH (HOLDLOCK) AS target \
             USING (SELECT ? AS visitor, ? AS attempts, ? AS valid_until, ? AS timeout_until) AS source \
             ON target.visitor = source.visitor \
             WHEN MATCHED THEN UPDATE SET attempts = source.attempts, \
             valid_until = source.valid_until, timeout_until = source.timeout_until \
             WHEN NOT MATCHED THEN INSERT (visitor, attempts, valid_until, timeout_until) \
             VALUES (source.visitor, source.attempts, source.valid_until, source.timeout_until);",
            table
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_placeholders() {
        let q = Dialect::Postgres.strategy();
        assert_eq!(
            q.challenge_load("t"),
            "SELECT data FROM t WHERE widget_id = $1 AND challenge_id = $2"
        );
        assert!(q.challenge_upsert("t").contains("$4"));
        assert!(q.attempts_purge("a").ends_with("$1"));
    }

    #[test]
    fn test_question_mark_dialects() {
        for dialect in [Dialect::MySql, Dialect::Sqlite, Dialect::SqlServer] {
            let q = dialect.strategy();
            assert!(!q.challenge_upsert("t").contains('$'));
            assert_eq!(q.challenge_upsert("t").matches('?').count(), 4);
            assert_eq!(q.attempts_upsert("a").matches('?').count(), 4);
            assert_eq!(q.challenge_delete("t").matches('?').count(), 2);
        }
    }

    #[test]
    fn test_sqlserver_uses_top() {
        let q = Dialect::SqlServer.strategy();
        assert!(q.challenge_exists("t").starts_with("SELECT TOP 1 1"));
        assert!(q.create_tables("c", "a").contains("OBJECT_ID(N'c', N'U')"));
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("iconcaptcha_challenges").is_ok());
        assert!(validate_table_name("t; DROP TABLE users").is_err());
        assert!(validate_table_name("1abc").is_err());
        assert!(validate_table_name("").is_err());
    }
}
