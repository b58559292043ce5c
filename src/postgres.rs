// ABOUTME: PostgreSQL-backed secondary store using INSERT ... ON CONFLICT DO UPDATE
// ABOUTME: Column types are read from information_schema once and cached per table

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use crate::applier::SecondaryStore;
use crate::config::sanitize_url;
use crate::registry::EntityDef;

/// Secondary store over a PostgreSQL connection.
///
/// JSON snapshot values are bound with the parameter types the target
/// columns expect, read from information_schema on first use per table.
pub struct PostgresStore {
    client: Client,
    schema: String,
    column_types: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .with_context(|| format!("failed to connect to {}", sanitize_url(url)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("secondary store connection closed: {e}");
            }
        });
        Ok(Self {
            client,
            schema: "public".to_string(),
            column_types: Mutex::new(HashMap::new()),
        })
    }

    /// Row count for one table; used by the sync-status comparison.
    pub async fn count_rows(&self, table: &str) -> Result<u64> {
        let row = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) FROM \"{}\".\"{table}\"", self.schema),
                &[],
            )
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>> {
        if let Some(types) = self.column_types.lock().unwrap().get(table) {
            return Ok(types.clone());
        }
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2",
                &[&self.schema, &table.to_string()],
            )
            .await
            .with_context(|| format!("failed to read column types of {table}"))?;
        if rows.is_empty() {
            return Err(anyhow!("table {table} does not exist on the secondary"));
        }
        let types: HashMap<String, String> = rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect();
        self.column_types
            .lock()
            .unwrap()
            .insert(table.to_string(), types.clone());
        Ok(types)
    }

    fn bind_columns(
        &self,
        table: &str,
        types: &HashMap<String, String>,
        columns: &[(String, Value)],
    ) -> Result<Vec<Box<dyn ToSql + Sync + Send>>> {
        columns
            .iter()
            .map(|(column, value)| {
                let dtype = types
                    .get(column)
                    .map(String::as_str)
                    .ok_or_else(|| anyhow!("column {column} does not exist in {table}"))?;
                json_param(value, dtype)
                    .with_context(|| format!("cannot bind {table}.{column} ({dtype})"))
            })
            .collect()
    }
}

#[async_trait]
impl SecondaryStore for PostgresStore {
    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .context("secondary database ping failed")?;
        Ok(())
    }

    async fn upsert(&self, entity: &EntityDef, row: &[(String, Value)]) -> Result<()> {
        let types = self.column_types(entity.table).await?;
        let params = self.bind_columns(entity.table, &types, row)?;
        let columns: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        let query = build_upsert_query(&self.schema, entity.table, entity.pk_columns, &columns);

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        self.client
            .execute(&query, &refs)
            .await
            .with_context(|| format!("failed to upsert into {}", entity.table))?;
        Ok(())
    }

    async fn delete(&self, entity: &EntityDef, primary_key: &[(String, Value)]) -> Result<()> {
        let types = self.column_types(entity.table).await?;
        let params = self.bind_columns(entity.table, &types, primary_key)?;
        let columns: Vec<&str> = primary_key.iter().map(|(c, _)| c.as_str()).collect();
        let query = build_delete_query(&self.schema, entity.table, &columns);

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        // Zero rows affected means the row was already gone: success.
        self.client
            .execute(&query, &refs)
            .await
            .with_context(|| format!("failed to delete from {}", entity.table))?;
        Ok(())
    }

    async fn count_rows(&self, entity: &EntityDef) -> Result<u64> {
        PostgresStore::count_rows(self, entity.table).await
    }
}

/// Build a single-row upsert with `$n` placeholders:
///
/// ```sql
/// INSERT INTO "public"."orders" ("id", "total") VALUES ($1, $2)
/// ON CONFLICT ("id") DO UPDATE SET "total" = EXCLUDED."total"
/// ```
fn build_upsert_query(schema: &str, table: &str, pk_columns: &[&str], columns: &[&str]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let conflict: Vec<String> = pk_columns.iter().map(|c| format!("\"{c}\"")).collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO \"{schema}\".\"{table}\" ({}) VALUES ({}) ON CONFLICT ({}) {action}",
        quoted.join(", "),
        placeholders.join(", "),
        conflict.join(", "),
    )
}

/// Build a delete by primary key, composite keys ANDed together.
fn build_delete_query(schema: &str, table: &str, pk_columns: &[&str]) -> String {
    let predicates: Vec<String> = pk_columns
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("\"{c}\" = ${}", idx + 1))
        .collect();
    format!(
        "DELETE FROM \"{schema}\".\"{table}\" WHERE {}",
        predicates.join(" AND ")
    )
}

/// Convert a JSON snapshot value into a typed query parameter matching the
/// target column's declared type.
fn json_param(value: &Value, dtype: &str) -> Result<Box<dyn ToSql + Sync + Send>> {
    match dtype {
        "smallint" | "int2" => Ok(Box::new(opt(value, |v| {
            v.as_i64().map(|i| i as i16)
        })?)),
        "integer" | "int4" => Ok(Box::new(opt(value, |v| {
            v.as_i64().map(|i| i as i32)
        })?)),
        "bigint" | "int8" => Ok(Box::new(opt(value, Value::as_i64)?)),
        "real" | "float4" => Ok(Box::new(opt(value, |v| v.as_f64().map(|f| f as f32))?)),
        "double precision" | "float8" => Ok(Box::new(opt(value, Value::as_f64)?)),
        "boolean" | "bool" => Ok(Box::new(opt(value, |v| match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        })?)),
        "json" | "jsonb" => Ok(Box::new(if value.is_null() {
            None
        } else {
            Some(value.clone())
        })),
        "timestamp without time zone" | "timestamp" => Ok(Box::new(opt(value, |v| {
            v.as_str().and_then(parse_naive_timestamp)
        })?)),
        "timestamp with time zone" | "timestamptz" => Ok(Box::new(opt(value, |v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })?)),
        // text, varchar, numeric rendered as text, and anything else
        _ => Ok(Box::new(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })),
    }
}

/// Null-preserving extraction; a non-null value the column type cannot
/// represent is an error rather than a silent null.
fn opt<T>(value: &Value, extract: impl Fn(&Value) -> Option<T>) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    extract(value)
        .map(Some)
        .ok_or_else(|| anyhow!("value {value} does not fit the column type"))
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
}
