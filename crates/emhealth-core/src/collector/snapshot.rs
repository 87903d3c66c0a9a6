use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::storage::Store;
use crate::storage::model::{MetricSnapshot, Readings, ResourceClass, StatementStat, Timestamp};

use super::source::{LockRegistry, MetricsSource};
use super::{CollectError, SourceError};

/// Per-class outcome of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectSummary {
    pub class: ResourceClass,
    pub resources: usize,
    pub written: usize,
    /// Placeholder rows for exclusively locked resources (included in `written`).
    pub locked: usize,
    /// Vanished between listing and reading.
    pub skipped: usize,
    /// Per-resource read errors or malformed readings.
    pub failed: usize,
    /// Rows already present for this instant.
    pub duplicates: usize,
}

impl CollectSummary {
    fn new(class: ResourceClass) -> Self {
        Self {
            class,
            resources: 0,
            written: 0,
            locked: 0,
            skipped: 0,
            failed: 0,
            duplicates: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementSummary {
    pub rows_read: usize,
    pub queries: usize,
    pub written: usize,
    pub duplicates: usize,
}

pub struct MetricsCollector<S: MetricsSource> {
    source: S,
}

impl<S: MetricsSource> MetricsCollector<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Append one snapshot per resource of `class` at `now`.
    pub fn collect(
        &mut self,
        store: &Store,
        class: ResourceClass,
        now: Timestamp,
    ) -> Result<CollectSummary, CollectError> {
        let mut summary = CollectSummary::new(class);

        let resources = self.source.list_resources(class)?;
        let registry = match class {
            ResourceClass::Database => LockRegistry::default(),
            _ => self.source.lock_registry()?,
        };
        summary.resources = resources.len();

        let mut rows = Vec::with_capacity(resources.len());
        for resource in &resources {
            let mut locked = registry.is_locked(resource);
            let readings = if locked {
                Readings::zeroed(class)
            } else {
                match self.source.read_counters(resource) {
                    Ok(r) if is_well_formed(class, &r) => r,
                    Ok(_) => {
                        debug!("Malformed readings for {} {}", class, resource.name);
                        summary.failed += 1;
                        continue;
                    }
                    Err(SourceError::Locked(msg)) => {
                        debug!("{} {} locked since the registry snapshot: {}", class, resource.name, msg);
                        locked = true;
                        Readings::zeroed(class)
                    }
                    Err(e) if e.is_transient() => {
                        debug!("Skipping {} {}: {}", class, resource.name, e);
                        match e {
                            SourceError::ResourceGone(_) => summary.skipped += 1,
                            _ => summary.failed += 1,
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            if locked {
                summary.locked += 1;
            }
            rows.push(MetricSnapshot {
                class,
                resource: resource.id,
                name: resource.name.clone(),
                collected_at: now,
                locked,
                readings,
            });
        }

        let outcome = store.append_snapshots(rows)?;
        summary.written = outcome.inserted;
        summary.duplicates = outcome.duplicates;

        if summary.failed > 0 {
            warn!("{} {} resources failed to collect", summary.failed, class);
        }
        debug!(
            "Collected {} {} snapshots ({} locked, {} skipped)",
            summary.written, class, summary.locked, summary.skipped
        );
        Ok(summary)
    }

    /// Snapshot pg_stat_statements, folded per query id.
    pub fn collect_statements(
        &mut self,
        store: &Store,
        now: Timestamp,
    ) -> Result<StatementSummary, CollectError> {
        let rows = self.source.statement_stats()?;
        let rows_read = rows.len();
        let folded = fold_statements(rows, now);
        let queries = folded.len();

        let outcome = store.append_statements(folded)?;
        if outcome.inserted > 0 {
            info!("Stored {} statement stats ({} source rows)", outcome.inserted, rows_read);
        }
        Ok(StatementSummary {
            rows_read,
            queries,
            written: outcome.inserted,
            duplicates: outcome.duplicates,
        })
    }
}

fn is_well_formed(class: ResourceClass, r: &Readings) -> bool {
    r.counters.len() == class.counter_names().len() && r.gauges.len() == class.gauge_names().len()
}

/// Sum rows sharing a query id (one per user/database) into one row.
fn fold_statements(rows: Vec<StatementStat>, now: Timestamp) -> Vec<StatementStat> {
    let mut by_query: BTreeMap<i64, StatementStat> = BTreeMap::new();
    for mut row in rows {
        match by_query.get_mut(&row.query_id) {
            Some(acc) => acc.fold(&row),
            None => {
                row.collected_at = now;
                by_query.insert(row.query_id, row);
            }
        }
    }
    by_query.into_values().collect()
}
