//! Current-state tables with an append-only history of superseded versions.
//!
//! `TrackedTable` holds exactly one live row per natural key. `apply` is the
//! only write path: it inserts an unknown key, ignores an identical row, and
//! for a changed row hands the before- and after-image to a [`HistoryHook`]
//! before overwriting. Callers serialize writers per table (the store keeps
//! each table behind its own mutex), so the diff-then-write is indivisible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::Timestamp;

/// Outcome of comparing incoming attributes with the live row.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<A> {
    Insert,
    Update { before: A },
    Unchanged,
}

impl<A> Change<A> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Change::Unchanged)
    }
}

/// Synchronous on-write hook, fired inside `apply` before the overwrite.
pub trait HistoryHook<K, A> {
    fn on_change(&mut self, key: &K, before: &A, after: &A, at: Timestamp);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTable<K: Ord, A> {
    rows: BTreeMap<K, A>,
}

impl<K: Ord, A> Default for TrackedTable<K, A> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, A: Clone + PartialEq> TrackedTable<K, A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diff(&self, key: &K, attrs: &A) -> Change<A> {
        match self.rows.get(key) {
            None => Change::Insert,
            Some(current) if current == attrs => Change::Unchanged,
            Some(current) => Change::Update {
                before: current.clone(),
            },
        }
    }

    pub fn apply(
        &mut self,
        key: K,
        attrs: A,
        at: Timestamp,
        hook: &mut impl HistoryHook<K, A>,
    ) -> Change<A> {
        let change = self.diff(&key, &attrs);
        match &change {
            Change::Unchanged => {}
            Change::Insert => {
                self.rows.insert(key, attrs);
            }
            Change::Update { before } => {
                hook.on_change(&key, before, &attrs, at);
                self.rows.insert(key, attrs);
            }
        }
        change
    }

    pub fn get(&self, key: &K) -> Option<&A> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &A)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop every row whose key matches. Used for instrument cascade.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|k, _| !pred(k));
        before - self.rows.len()
    }
}

/// One superseded version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow<A> {
    pub attrs: A,
    pub recorded_at: Timestamp,
}

/// Append-only history, grouped by key in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryLog<K: Ord, A> {
    rows: BTreeMap<K, Vec<HistoryRow<A>>>,
}

impl<K: Ord, A> Default for HistoryLog<K, A> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, A: Clone> HistoryLog<K, A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// History of `key` recorded within `[from, to]`, oldest first.
    pub fn range(&self, key: &K, from: Timestamp, to: Timestamp) -> Vec<HistoryRow<A>> {
        self.rows
            .get(key)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.recorded_at >= from && r.recorded_at <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.rows
            .values()
            .filter_map(|rows| rows.first().map(|r| r.recorded_at))
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Bulk retention: drop rows recorded before `cutoff` for keys matching
    /// `pred`. The only mutation history rows ever see.
    pub fn purge_before(&mut self, cutoff: Timestamp, mut pred: impl FnMut(&K) -> bool) -> usize {
        let mut removed = 0;
        self.rows.retain(|k, rows| {
            if pred(k) {
                let before = rows.len();
                rows.retain(|r| r.recorded_at >= cutoff);
                removed += before - rows.len();
            }
            !rows.is_empty()
        });
        removed
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let mut removed = 0;
        self.rows.retain(|k, rows| {
            if pred(k) {
                removed += rows.len();
                false
            } else {
                true
            }
        });
        removed
    }
}

impl<K: Ord + Clone, A: Clone> HistoryHook<K, A> for HistoryLog<K, A> {
    fn on_change(&mut self, key: &K, before: &A, _after: &A, at: Timestamp) {
        self.rows.entry(key.clone()).or_default().push(HistoryRow {
            attrs: before.clone(),
            recorded_at: at,
        });
    }
}

/// A current-state table paired with its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracked<K: Ord, A> {
    pub current: TrackedTable<K, A>,
    pub history: HistoryLog<K, A>,
}

impl<K: Ord, A> Default for Tracked<K, A> {
    fn default() -> Self {
        Self {
            current: TrackedTable::default(),
            history: HistoryLog::default(),
        }
    }
}

impl<K: Ord + Clone, A: Clone + PartialEq> Tracked<K, A> {
    pub fn apply(&mut self, key: K, attrs: A, at: Timestamp) -> Change<A> {
        self.current.apply(key, attrs, at, &mut self.history)
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        self.history.remove_where(&mut pred);
        self.current.remove_where(pred)
    }
}
