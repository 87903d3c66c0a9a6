//! In-memory metrics source for tests.

use std::collections::BTreeMap;

use crate::storage::model::{Readings, ResourceClass, ResourceId, StatementStat};

use super::SourceError;
use super::source::{LockRegistry, MetricsSource, Resource};

#[derive(Default)]
pub(crate) struct MockSource {
    pub resources: BTreeMap<ResourceClass, Vec<Resource>>,
    /// Missing entry reads as a vanished resource.
    pub readings: BTreeMap<ResourceId, Readings>,
    pub locked: Vec<ResourceId>,
    /// Locked after the registry snapshot: reads time out.
    pub locked_on_read: Vec<ResourceId>,
    pub statements: Vec<StatementStat>,
    pub fail_listing: bool,
    /// Resources whose counters were read, in order.
    pub reads: Vec<ResourceId>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, class: ResourceClass, id: ResourceId, name: &str, parent: Option<u32>) {
        self.resources.entry(class).or_default().push(Resource {
            class,
            id,
            name: name.to_string(),
            parent_oid: parent,
        });
    }

    /// Table in database 1 whose first counter (`seq_scan`) is `seq_scan`.
    pub fn add_table(&mut self, oid: u32, name: &str, seq_scan: i64) -> ResourceId {
        let id = ResourceId {
            database_oid: 1,
            object_oid: oid,
        };
        self.add(ResourceClass::Table, id, name, None);
        self.set_counter(id, ResourceClass::Table, seq_scan);
        id
    }

    pub fn add_index(&mut self, oid: u32, table: u32, name: &str, idx_scan: i64) -> ResourceId {
        let id = ResourceId {
            database_oid: 1,
            object_oid: oid,
        };
        self.add(ResourceClass::Index, id, name, Some(table));
        self.set_counter(id, ResourceClass::Index, idx_scan);
        id
    }

    pub fn add_database(&mut self, oid: u32, name: &str, xact_commit: i64) -> ResourceId {
        let id = ResourceId::database(oid);
        self.add(ResourceClass::Database, id, name, None);
        self.set_counter(id, ResourceClass::Database, xact_commit);
        id
    }

    pub fn set_counter(&mut self, id: ResourceId, class: ResourceClass, value: i64) {
        let mut readings = Readings::zeroed(class);
        readings.counters[0] = value;
        readings.gauges[0] = 8192;
        self.readings.insert(id, readings);
    }

    /// Listed but gone by the time it is read.
    pub fn drop_resource(&mut self, id: ResourceId) {
        self.readings.remove(&id);
    }
}

impl MetricsSource for MockSource {
    fn list_resources(&mut self, class: ResourceClass) -> Result<Vec<Resource>, SourceError> {
        if self.fail_listing {
            return Err(SourceError::ConnectionError("connection refused".into()));
        }
        Ok(self.resources.get(&class).cloned().unwrap_or_default())
    }

    fn lock_registry(&mut self) -> Result<LockRegistry, SourceError> {
        Ok(LockRegistry::from_relations(self.locked.iter().copied()))
    }

    fn read_counters(&mut self, resource: &Resource) -> Result<Readings, SourceError> {
        self.reads.push(resource.id);
        if self.locked_on_read.contains(&resource.id) {
            return Err(SourceError::Locked(format!(
                "canceling statement due to lock timeout on {}",
                resource.name
            )));
        }
        self.readings
            .get(&resource.id)
            .cloned()
            .ok_or_else(|| SourceError::ResourceGone(resource.name.clone()))
    }

    fn statement_stats(&mut self) -> Result<Vec<StatementStat>, SourceError> {
        Ok(self.statements.clone())
    }
}
