//! Last-write-wins materialization of change-log entries
//!
//! Pure functions, no I/O. Callers sort entries with [`sort_entries`] before
//! folding them with [`materialize`]; the result is then independent of the
//! order in which the logs were read.

use crate::models::{ChangeLogEntry, Operation, ShotMap};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Merge order: timestamp, then device id
pub fn merge_order(a: &ChangeLogEntry, b: &ChangeLogEntry) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.device_id.cmp(&b.device_id))
}

/// Sorts entries into merge order (stable: equal keys keep read order)
pub fn sort_entries(entries: &mut [ChangeLogEntry]) {
    entries.sort_by(merge_order);
}

/// Folds sorted entries onto a copy of `baseline`
pub fn materialize(entries: &[ChangeLogEntry], baseline: &ShotMap) -> ShotMap {
    let mut state = baseline.clone();
    apply_entries(&mut state, entries);
    state
}

/// Applies entries in the given order; the last write per shot path wins
pub fn apply_entries(state: &mut ShotMap, entries: &[ChangeLogEntry]) {
    for entry in entries {
        match entry.operation {
            Operation::Update => match &entry.data {
                Some(shot) => {
                    state.insert(entry.shot_path.clone(), shot.clone());
                }
                None => {
                    log::warn!(
                        "Ignoring update without data for {} from device {}",
                        entry.shot_path,
                        entry.device_id
                    );
                }
            },
            Operation::Delete => {
                state.remove(&entry.shot_path);
            }
        }
    }
}

/// Index of the entry that decides each shot path's final state
pub fn winning_indices(sorted: &[ChangeLogEntry]) -> HashSet<usize> {
    let mut last = HashMap::new();
    for (idx, entry) in sorted.iter().enumerate() {
        if entry.operation == Operation::Update && entry.data.is_none() {
            continue;
        }
        last.insert(entry.shot_path.as_str(), idx);
    }
    last.into_values().collect()
}
