//! Declared entity types and their merge strategies
//!
//! The set of syncable types is closed and declared here; adding a type is an edit
//! to this table, not new control flow in the coordinator.

/// How incoming records of a type are reconciled with stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Last write wins at record granularity
    WholeRecord,
    /// Whole-record replace, except the named map-valued fields, which merge
    /// at sub-key granularity across concurrent writers
    FieldMerge { fields: &'static [&'static str] },
    /// At most one live record per owner; a multi-record batch collapses to the
    /// one with the latest client timestamp before merging
    SingletonCollapse,
}

/// One declared syncable type
#[derive(Debug, Clone, Copy)]
pub struct EntityTypeDef {
    /// Wire name, also the storage partition key
    pub name: &'static str,
    pub strategy: MergeStrategy,
}

impl EntityTypeDef {
    pub fn is_singleton(&self) -> bool {
        matches!(self.strategy, MergeStrategy::SingletonCollapse)
    }

    /// Fields merged at sub-key granularity for this type
    pub fn merge_fields(&self) -> &'static [&'static str] {
        match self.strategy {
            MergeStrategy::FieldMerge { fields } => fields,
            _ => &[],
        }
    }
}

/// Storage id for singleton rows.
///
/// Singleton identity is the owner alone, so every writer lands on the same
/// primary key; concurrent first syncs collide on the row instead of leaving
/// two live rows under distinct client-proposed ids.
pub const SINGLETON_ID: &str = "singleton";

/// Every type this server knows how to sync
pub const ENTITY_TYPES: &[EntityTypeDef] = &[
    EntityTypeDef {
        name: "tasks",
        strategy: MergeStrategy::WholeRecord,
    },
    EntityTypeDef {
        name: "journalEntries",
        strategy: MergeStrategy::WholeRecord,
    },
    EntityTypeDef {
        name: "habits",
        strategy: MergeStrategy::FieldMerge {
            fields: &["history"],
        },
    },
    EntityTypeDef {
        name: "budget",
        strategy: MergeStrategy::SingletonCollapse,
    },
    EntityTypeDef {
        name: "schedule",
        strategy: MergeStrategy::SingletonCollapse,
    },
];

/// Look up a declared type by wire name
pub fn lookup(name: &str) -> Option<&'static EntityTypeDef> {
    ENTITY_TYPES.iter().find(|def| def.name == name)
}
