use std::collections::BTreeSet;

use crate::storage::model::{Readings, ResourceClass, ResourceId, StatementStat};

use super::SourceError;

/// A tracked database, table or index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub class: ResourceClass,
    pub id: ResourceId,
    /// `datname`, or `schemaname.relname` for tables and indexes.
    pub name: String,
    /// Owning table of an index.
    pub parent_oid: Option<u32>,
}

/// Snapshot of relations holding a granted `AccessExclusiveLock`.
///
/// Taken once per batch from `pg_locks`, which never blocks; the collector
/// consults it instead of trying to acquire anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRegistry {
    relations: BTreeSet<ResourceId>,
}

impl LockRegistry {
    pub fn from_relations(relations: impl IntoIterator<Item = ResourceId>) -> Self {
        Self {
            relations: relations.into_iter().collect(),
        }
    }

    /// Databases are never locked; an index is locked when it or its
    /// table is.
    pub fn is_locked(&self, resource: &Resource) -> bool {
        if resource.class == ResourceClass::Database {
            return false;
        }
        if self.relations.contains(&resource.id) {
            return true;
        }
        resource.parent_oid.is_some_and(|table| {
            self.relations.contains(&ResourceId {
                database_oid: resource.id.database_oid,
                object_oid: table,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Where counters come from.
pub trait MetricsSource {
    /// Resources of `class` currently tracked. Failure is systemic.
    fn list_resources(&mut self, class: ResourceClass) -> Result<Vec<Resource>, SourceError>;

    /// Current lock registry snapshot. Failure is systemic.
    fn lock_registry(&mut self) -> Result<LockRegistry, SourceError>;

    /// Counters and gauges of one resource, ordered as the class'
    /// `counter_names` / `gauge_names`.
    fn read_counters(&mut self, resource: &Resource) -> Result<Readings, SourceError>;

    /// pg_stat_statements rows, one per (user, database, query id).
    /// `collected_at` is filled in by the collector.
    fn statement_stats(&mut self) -> Result<Vec<StatementStat>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(db: u32, oid: u32, table: u32) -> Resource {
        Resource {
            class: ResourceClass::Index,
            id: ResourceId {
                database_oid: db,
                object_oid: oid,
            },
            name: format!("public.idx{oid}"),
            parent_oid: Some(table),
        }
    }

    #[test]
    fn test_index_locked_through_table() {
        let reg = LockRegistry::from_relations([ResourceId {
            database_oid: 5,
            object_oid: 100,
        }]);
        assert!(reg.is_locked(&index(5, 200, 100)));
        assert!(!reg.is_locked(&index(6, 200, 100)));
        assert!(!reg.is_locked(&index(5, 201, 101)));
    }

    #[test]
    fn test_database_never_locked() {
        let reg = LockRegistry::from_relations([ResourceId::database(5)]);
        let db = Resource {
            class: ResourceClass::Database,
            id: ResourceId::database(5),
            name: "postgres".into(),
            parent_oid: None,
        };
        assert!(!reg.is_locked(&db));
    }
}
