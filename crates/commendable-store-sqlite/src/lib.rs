use std::path::Path;

use anyhow::{anyhow, Context, Result};
use commendable_core::{CoreError, Item, OrderedStore, RangeKey, ScanRange};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entries (
  range_key TEXT NOT NULL,
  entry_key BLOB NOT NULL,
  entry_value BLOB NOT NULL,
  PRIMARY KEY (range_key, entry_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_entries_mirror ON entries(range_key, entry_value, entry_key);
";

/// SQLite-backed [`OrderedStore`].
///
/// All ranges share one table; the `(range_key, entry_value, entry_key)`
/// index serves mirror scans. The connection is serialized behind a mutex,
/// which gives per-key atomicity and nothing more.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy)]
enum Ordering {
    ByKey,
    ByValue,
}

impl Ordering {
    fn position_column(self) -> &'static str {
        match self {
            Self::ByKey => "entry_key",
            Self::ByValue => "entry_value",
        }
    }

    fn order_by(self, direction: &str) -> String {
        match self {
            Self::ByKey => format!("entry_key {direction}"),
            Self::ByValue => format!("entry_value {direction}, entry_key {direction}"),
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error when `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version < 1 {
            apply_migration_1(&conn)?;
            version = current_schema_version(&conn)?;
            tracing::info!(version, "applied store migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn put_entry(&self, range: &RangeKey, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO entries(range_key, entry_key, entry_value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(range_key, entry_key)
                 DO UPDATE SET entry_value = excluded.entry_value",
                params![range.as_str(), key, value],
            )
            .with_context(|| format!("failed to write entry in range {range}"))?;
        Ok(())
    }

    fn get_entry(&self, range: &RangeKey, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT entry_value FROM entries WHERE range_key = ?1 AND entry_key = ?2",
                params![range.as_str(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read entry in range {range}"))?;
        Ok(value)
    }

    fn delete_entry(&self, range: &RangeKey, key: &[u8]) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM entries WHERE range_key = ?1 AND entry_key = ?2",
                params![range.as_str(), key],
            )
            .with_context(|| format!("failed to delete entry in range {range}"))?;
        Ok(deleted > 0)
    }

    fn scan(&self, range: &RangeKey, scan: &ScanRange, ordering: Ordering) -> Result<Vec<Item>> {
        let position = ordering.position_column();
        let mut sql =
            String::from("SELECT entry_key, entry_value FROM entries WHERE range_key = ?1");
        let mut values = vec![Value::Text(range.as_str().to_string())];

        if let Some(min) = &scan.min {
            let operator = if scan.min_inclusive { ">=" } else { ">" };
            values.push(Value::Blob(min.clone()));
            sql.push_str(&format!(" AND {position} {operator} ?{}", values.len()));
        }
        if let Some(max) = &scan.max {
            let operator = if scan.max_inclusive { "<=" } else { "<" };
            values.push(Value::Blob(max.clone()));
            sql.push_str(&format!(" AND {position} {operator} ?{}", values.len()));
        }

        let direction = if scan.reverse { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {}", ordering.order_by(direction)));
        if let Some(limit) = scan.limit {
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&sql).with_context(|| format!("failed to prepare scan of {range}"))?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            items.push(match ordering {
                Ordering::ByKey => Item { key, value },
                Ordering::ByValue => Item { key: value, value: key },
            });
        }
        Ok(items)
    }

    fn count_entries(&self, range: &RangeKey) -> Result<usize> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM entries WHERE range_key = ?1",
                params![range.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count range {range}"))?;
        usize::try_from(count).context("entry count out of range")
    }

    fn clear_range(&self, range: &RangeKey) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM entries WHERE range_key = ?1", params![range.as_str()])
            .with_context(|| format!("failed to clear range {range}"))?;
        Ok(())
    }
}

impl OrderedStore for SqliteStore {
    fn put(&self, range: &RangeKey, key: &[u8], value: &[u8]) -> Result<(), CoreError> {
        self.put_entry(range, key, value).map_err(store_error)
    }

    fn get(&self, range: &RangeKey, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        self.get_entry(range, key).map_err(store_error)
    }

    fn delete(&self, range: &RangeKey, key: &[u8]) -> Result<bool, CoreError> {
        self.delete_entry(range, key).map_err(store_error)
    }

    fn slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError> {
        self.scan(range, scan, Ordering::ByKey).map_err(store_error)
    }

    fn mirror_slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError> {
        self.scan(range, scan, Ordering::ByValue).map_err(store_error)
    }

    fn count(&self, range: &RangeKey) -> Result<usize, CoreError> {
        self.count_entries(range).map_err(store_error)
    }

    fn clear(&self, range: &RangeKey) -> Result<(), CoreError> {
        self.clear_range(range).map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> CoreError {
    CoreError::Store(format!("{err:#}"))
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
