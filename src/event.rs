// ABOUTME: ChangeEvent - the unit of replication captured from a primary-store commit
// ABOUTME: Carries entity kind, primary-key filter, column snapshot, and retry bookkeeping

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::Registry;

/// Replication operation. Insert and Update collapse into `Upsert` because
/// the applier writes the full column snapshot either way; only Delete is
/// distinct on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            // insert/update are accepted for callers that still speak the
            // primary store's three-way vocabulary
            "upsert" | "insert" | "update" => Ok(Operation::Upsert),
            "delete" => Ok(Operation::Delete),
            other => Err(anyhow!("unknown replication op: {other}")),
        }
    }
}

/// A structurally invalid event. These are dropped by the dispatch loop
/// without retry: replaying a malformed event can never succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEvent {
    #[error("entity kind {0:?} is not registered for replication")]
    UnknownKind(String),
    #[error("primary key is empty")]
    EmptyPrimaryKey,
    #[error("upsert event for {0:?} is missing its column snapshot")]
    MissingSnapshot(String),
    #[error("delete event for {0:?} carries a column snapshot")]
    UnexpectedSnapshot(String),
}

/// One captured primary-store mutation, queued for replication.
///
/// Column values are plain JSON primitives; enum-typed columns must be
/// normalized to their stable string or numeric representation by the
/// caller before capture, so the secondary store can reconstruct them
/// without the primary process's in-memory types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub entity_kind: String,
    /// Ordered column -> value pairs uniquely identifying the target row;
    /// may be composite. Never empty.
    pub primary_key: Vec<(String, Value)>,
    /// Full column snapshot taken at commit time. Present iff the
    /// operation is `Upsert`.
    pub column_snapshot: Option<Vec<(String, Value)>>,
    /// Capture timestamp, diagnostics only.
    pub created_at: DateTime<Utc>,
    /// Incremented by the dispatch loop on each failed apply.
    pub attempt_count: u32,
}

impl ChangeEvent {
    pub fn upsert(
        kind: impl Into<String>,
        primary_key: Vec<(String, Value)>,
        snapshot: Vec<(String, Value)>,
    ) -> Self {
        Self {
            operation: Operation::Upsert,
            entity_kind: kind.into(),
            primary_key,
            column_snapshot: Some(snapshot),
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }

    pub fn delete(kind: impl Into<String>, primary_key: Vec<(String, Value)>) -> Self {
        Self {
            operation: Operation::Delete,
            entity_kind: kind.into(),
            primary_key,
            column_snapshot: None,
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Stable `(kind, primary key)` identity used by the dedup guard.
    pub fn object_id(&self) -> String {
        let mut id = self.entity_kind.clone();
        for (column, value) in &self.primary_key {
            id.push(':');
            id.push_str(column);
            id.push('=');
            id.push_str(&value.to_string());
        }
        id
    }

    /// Check the event against the structural invariants and the registry
    /// of replicable kinds.
    pub fn validate(&self, registry: &Registry) -> Result<(), InvalidEvent> {
        if registry.get(&self.entity_kind).is_none() {
            return Err(InvalidEvent::UnknownKind(self.entity_kind.clone()));
        }
        if self.primary_key.is_empty() {
            return Err(InvalidEvent::EmptyPrimaryKey);
        }
        match (self.operation, self.column_snapshot.is_some()) {
            (Operation::Upsert, false) => {
                Err(InvalidEvent::MissingSnapshot(self.entity_kind.clone()))
            }
            (Operation::Delete, true) => {
                Err(InvalidEvent::UnexpectedSnapshot(self.entity_kind.clone()))
            }
            _ => Ok(()),
        }
    }
}
