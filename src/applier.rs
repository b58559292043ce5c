// ABOUTME: Translates a ChangeEvent into an idempotent write against the secondary store
// ABOUTME: Upsert-by-primary-key makes replay a no-op; delete of a missing row succeeds

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::event::{ChangeEvent, InvalidEvent, Operation};
use crate::registry::{EntityDef, Registry};

/// Seam to the replication target. Implementations must be idempotent:
/// upserting the same row twice and deleting an absent row both succeed.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Minimal liveness probe (a trivial query).
    async fn ping(&self) -> Result<()>;

    /// Insert-or-update by primary key. `row` carries the primary-key
    /// columns followed by the snapshot columns, already merged.
    async fn upsert(&self, entity: &EntityDef, row: &[(String, Value)]) -> Result<()>;

    /// Delete by primary key. Deleting a row that is already gone is
    /// success, not an error.
    async fn delete(&self, entity: &EntityDef, primary_key: &[(String, Value)]) -> Result<()>;

    /// Current row count of the entity's table, for sync-status
    /// comparisons against the primary.
    async fn count_rows(&self, entity: &EntityDef) -> Result<u64>;
}

/// Why an apply did not succeed. The dispatch loop is the single place
/// that turns this into retry vs drop.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Structurally broken event; dropped immediately, never retried.
    #[error("malformed event: {0}")]
    Invalid(#[from] InvalidEvent),
    /// The write itself failed; safe to retry, the store rolled back.
    #[error("secondary store write failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Applies ChangeEvents to a secondary store through the registry.
pub struct Applier {
    registry: Registry,
    store: Arc<dyn SecondaryStore>,
}

impl Applier {
    pub fn new(registry: Registry, store: Arc<dyn SecondaryStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn apply(&self, event: &ChangeEvent) -> Result<(), ApplyError> {
        event.validate(&self.registry)?;
        // validate() guarantees the kind resolves and the snapshot matches
        // the operation.
        let entity = self
            .registry
            .get(&event.entity_kind)
            .ok_or_else(|| InvalidEvent::UnknownKind(event.entity_kind.clone()))?;

        match event.operation {
            Operation::Upsert => {
                let snapshot = event
                    .column_snapshot
                    .as_deref()
                    .ok_or_else(|| InvalidEvent::MissingSnapshot(event.entity_kind.clone()))?;
                let row = merge_row(&event.primary_key, snapshot);
                self.store
                    .upsert(entity, &row)
                    .await
                    .map_err(ApplyError::Store)
            }
            Operation::Delete => self
                .store
                .delete(entity, &event.primary_key)
                .await
                .map_err(ApplyError::Store),
        }
    }
}

/// Primary-key columns first, then snapshot columns that are not already
/// part of the key. Snapshots captured from the primary usually repeat the
/// key columns; the key values win.
fn merge_row(
    primary_key: &[(String, Value)],
    snapshot: &[(String, Value)],
) -> Vec<(String, Value)> {
    let mut row = primary_key.to_vec();
    for (column, value) in snapshot {
        if !primary_key.iter().any(|(pk, _)| pk == column) {
            row.push((column.clone(), value.clone()));
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory secondary keyed by (table, pk identity).
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<(String, String), Vec<(String, Value)>>>,
        fail_writes: AtomicBool,
    }

    fn key_of(entity: &EntityDef, primary_key: &[(String, Value)]) -> (String, String) {
        let pk = primary_key
            .iter()
            .map(|(c, v)| format!("{c}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        (entity.table.to_string(), pk)
    }

    #[async_trait]
    impl SecondaryStore for MemoryStore {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn upsert(&self, entity: &EntityDef, row: &[(String, Value)]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("injected write failure"));
            }
            let pk: Vec<(String, Value)> = row
                .iter()
                .filter(|(c, _)| entity.pk_columns.contains(&c.as_str()))
                .cloned()
                .collect();
            self.rows
                .lock()
                .unwrap()
                .insert(key_of(entity, &pk), row.to_vec());
            Ok(())
        }

        async fn delete(&self, entity: &EntityDef, primary_key: &[(String, Value)]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("injected write failure"));
            }
            self.rows.lock().unwrap().remove(&key_of(entity, primary_key));
            Ok(())
        }

        async fn count_rows(&self, entity: &EntityDef) -> Result<u64> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.keys().filter(|(table, _)| table == entity.table).count() as u64)
        }
    }

    fn order_upsert(id: i64, total: f64, status: &str) -> ChangeEvent {
        ChangeEvent::upsert(
            "orders",
            vec![("id".to_string(), json!(id))],
            vec![
                ("id".to_string(), json!(id)),
                ("total".to_string(), json!(total)),
                ("status".to_string(), json!(status)),
            ],
        )
    }

    #[tokio::test]
    async fn upsert_then_delete_leaves_no_row() {
        let store = Arc::new(MemoryStore::default());
        let applier = Applier::new(Registry::builtin(), store.clone());

        applier.apply(&order_upsert(7, 42.0, "CART")).await.unwrap();
        applier.apply(&order_upsert(7, 42.0, "PAID")).await.unwrap();
        applier
            .apply(&ChangeEvent::delete(
                "orders",
                vec![("id".to_string(), json!(7))],
            ))
            .await
            .unwrap();

        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let applier = Applier::new(Registry::builtin(), store.clone());

        let event = order_upsert(7, 42.0, "PAID");
        applier.apply(&event).await.unwrap();
        let first = store.rows.lock().unwrap().clone();
        applier.apply(&event).await.unwrap();
        let second = store.rows.lock().unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn delete_of_absent_row_is_success() {
        let store = Arc::new(MemoryStore::default());
        let applier = Applier::new(Registry::builtin(), store);
        let result = applier
            .apply(&ChangeEvent::delete(
                "orders",
                vec![("id".to_string(), json!(999))],
            ))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_event_is_invalid_not_store_error() {
        let store = Arc::new(MemoryStore::default());
        let applier = Applier::new(Registry::builtin(), store);
        let event = ChangeEvent::delete("invoices", vec![("id".to_string(), json!(1))]);
        match applier.apply(&event).await {
            Err(ApplyError::Invalid(InvalidEvent::UnknownKind(kind))) => {
                assert_eq!(kind, "invoices")
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_failure_maps_to_retryable_error() {
        let store = Arc::new(MemoryStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let applier = Applier::new(Registry::builtin(), store);
        match applier.apply(&order_upsert(1, 10.0, "CART")).await {
            Err(ApplyError::Store(_)) => {}
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn merge_row_prefers_key_values_and_keeps_order() {
        let pk = vec![("id".to_string(), json!(7))];
        let snapshot = vec![
            ("id".to_string(), json!(8)),
            ("total".to_string(), json!(42.0)),
        ];
        let row = merge_row(&pk, &snapshot);
        assert_eq!(row[0], ("id".to_string(), json!(7)));
        assert_eq!(row[1], ("total".to_string(), json!(42.0)));
        assert_eq!(row.len(), 2);
    }
}
