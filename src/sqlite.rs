// ABOUTME: SQLite-backed secondary store - upsert/delete via dynamically built SQL
// ABOUTME: JSON column values are mapped onto SQLite types before binding

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use crate::applier::SecondaryStore;
use crate::registry::EntityDef;

/// Secondary store over a SQLite database.
///
/// Statements are local file I/O and brief, so they run inline on the
/// dispatch worker under the connection mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open secondary database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for secondary database")?;
        conn.pragma_update(None, "synchronous", &"normal").ok();
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run arbitrary setup SQL (schema creation in tests and first-run
    /// provisioning).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(sql)
            .context("failed to execute setup batch")
    }

    /// Row count for one table; used by the sync-status comparison.
    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl SecondaryStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("secondary database ping failed")?;
        Ok(())
    }

    async fn upsert(&self, entity: &EntityDef, row: &[(String, Value)]) -> Result<()> {
        let columns: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        let sql = build_upsert_sql(entity.table, entity.pk_columns, &columns);
        let params: Vec<rusqlite::types::Value> =
            row.iter().map(|(_, v)| json_to_sql(v)).collect();

        let conn = self.conn.lock().unwrap();
        conn.execute(&sql, params_from_iter(params))
            .with_context(|| format!("failed to upsert into {}", entity.table))?;
        Ok(())
    }

    async fn delete(&self, entity: &EntityDef, primary_key: &[(String, Value)]) -> Result<()> {
        let columns: Vec<&str> = primary_key.iter().map(|(c, _)| c.as_str()).collect();
        let sql = build_delete_sql(entity.table, &columns);
        let params: Vec<rusqlite::types::Value> =
            primary_key.iter().map(|(_, v)| json_to_sql(v)).collect();

        let conn = self.conn.lock().unwrap();
        // Zero rows affected means the row was already gone: success.
        conn.execute(&sql, params_from_iter(params))
            .with_context(|| format!("failed to delete from {}", entity.table))?;
        Ok(())
    }

    async fn count_rows(&self, entity: &EntityDef) -> Result<u64> {
        self.count_rows(entity.table)
    }
}

/// Build a single-row upsert:
///
/// ```sql
/// INSERT INTO "orders" ("id", "total") VALUES (?1, ?2)
/// ON CONFLICT("id") DO UPDATE SET "total" = excluded."total"
/// ```
fn build_upsert_sql(table: &str, pk_columns: &[&str], columns: &[&str]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let conflict: Vec<String> = pk_columns.iter().map(|c| format!("\"{c}\"")).collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({}) ON CONFLICT({}) {action}",
        quoted.join(", "),
        placeholders.join(", "),
        conflict.join(", "),
    )
}

/// Build a delete by primary key, composite keys ANDed together.
fn build_delete_sql(table: &str, pk_columns: &[&str]) -> String {
    let predicates: Vec<String> = pk_columns
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("\"{c}\" = ?{}", idx + 1))
        .collect();
    format!(
        "DELETE FROM \"{table}\" WHERE {}",
        predicates.join(" AND ")
    )
}

/// Map a JSON column value onto the SQLite type system. Structured values
/// are stored as their JSON text; enum-typed columns arrive already
/// normalized to strings or numbers by capture.
fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}
