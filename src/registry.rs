// ABOUTME: Static registry mapping entity-kind tags to secondary-store tables
// ABOUTME: Resolved once at startup; replaces the original's runtime reflection

/// Description of one replicable entity kind: which secondary-store table
/// it lands in and which columns form its primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub kind: &'static str,
    pub table: &'static str,
    pub pk_columns: &'static [&'static str],
}

/// The POS schema, in dependency order (parents before children) so a full
/// resync can enqueue rows without violating foreign keys on the secondary.
const BUILTIN_ENTITIES: &[EntityDef] = &[
    EntityDef {
        kind: "product_types",
        table: "product_types",
        pk_columns: &["id"],
    },
    EntityDef {
        kind: "products",
        table: "products",
        pk_columns: &["id"],
    },
    EntityDef {
        kind: "users",
        table: "users",
        pk_columns: &["id"],
    },
    EntityDef {
        kind: "orders",
        table: "orders",
        pk_columns: &["id"],
    },
    EntityDef {
        kind: "order_items",
        table: "order_items",
        pk_columns: &["order_id", "product_id"],
    },
    EntityDef {
        kind: "qr_codes",
        table: "qr_codes",
        pk_columns: &["order_id"],
    },
    EntityDef {
        kind: "seat_delivery_surveys",
        table: "seat_delivery_surveys",
        pk_columns: &["id"],
    },
];

/// Set of entity kinds eligible for replication.
///
/// Events whose kind is not registered are malformed and dropped without
/// retry. Tests construct custom registries; production uses `builtin()`.
#[derive(Debug, Clone)]
pub struct Registry {
    entities: Vec<EntityDef>,
}

impl Registry {
    /// Registry covering the full POS schema.
    pub fn builtin() -> Self {
        Self {
            entities: BUILTIN_ENTITIES.to_vec(),
        }
    }

    pub fn new(entities: Vec<EntityDef>) -> Self {
        Self { entities }
    }

    pub fn get(&self, kind: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|def| def.kind == kind)
    }

    /// All registered entities, in dependency order.
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}
