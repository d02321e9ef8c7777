// src/core/balance/receiver_plan.rs

//! The receiver plan: range -> (destination, state), indexed two ways.
//!
//! The by-range index is unique and ordered (iteration in range order is part
//! of the contract); the by-destination view is derived by scanning, which is
//! fine at recovery-plan sizes.

use crate::core::types::{Location, QualifiedRange, RangeState, TableId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ReceiverEntry {
    pub location: Location,
    pub state: RangeState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ReceiverPlan {
    entries: BTreeMap<QualifiedRange, ReceiverEntry>,
}

impl ReceiverPlan {
    /// Inserts or reroutes a range. The by-range index is unique, so a second
    /// insert for the same range replaces the destination.
    pub fn insert(&mut self, range: QualifiedRange, location: Location, state: RangeState) {
        self.entries
            .insert(range, ReceiverEntry { location, state });
    }

    pub fn remove(&mut self, range: &QualifiedRange) -> Option<ReceiverEntry> {
        self.entries.remove(range)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Distinct destinations, in location order.
    pub fn locations(&self) -> BTreeSet<Location> {
        self.entries.values().map(|e| e.location.clone()).collect()
    }

    /// Ranges destined for `location`, in range order.
    pub fn ranges_for(&self, location: &Location) -> Vec<QualifiedRange> {
        self.entries
            .iter()
            .filter(|(_, e)| &e.location == location)
            .map(|(range, _)| range.clone())
            .collect()
    }

    /// Ranges plus their source states destined for `location`.
    pub fn ranges_and_states_for(
        &self,
        location: &Location,
    ) -> (Vec<QualifiedRange>, Vec<RangeState>) {
        let mut ranges = Vec::new();
        let mut states = Vec::new();
        for (range, entry) in &self.entries {
            if &entry.location == location {
                ranges.push(range.clone());
                states.push(entry.state.clone());
            }
        }
        (ranges, states)
    }

    /// Destination of the range containing `row` within `table`, if planned.
    pub fn location_of_row(&self, table: &TableId, row: &str) -> Option<&Location> {
        self.entries.iter().find_map(|(range, entry)| {
            (range.table.id == table.id && range.range.contains(row)).then_some(&entry.location)
        })
    }

    pub fn location_of(&self, range: &QualifiedRange) -> Option<&Location> {
        self.entries.get(range).map(|e| &e.location)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QualifiedRange, &ReceiverEntry)> {
        self.entries.iter()
    }

    /// Removes every entry destined for `location`, returning the removed
    /// ranges with their states.
    pub fn drain_location(&mut self, location: &Location) -> Vec<(QualifiedRange, RangeState)> {
        let drained: Vec<QualifiedRange> = self.ranges_for(location);
        drained
            .into_iter()
            .map(|range| {
                let entry = self.entries.remove(&range).expect("listed above");
                (range, entry.state)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RangeSpec;

    fn range(table: &str, start: &str, end: &str) -> QualifiedRange {
        QualifiedRange::new(TableId::new(table, 1), RangeSpec::new(start, end))
    }

    #[test]
    fn dual_index_queries() {
        let mut plan = ReceiverPlan::default();
        let rs2 = Location::new("rs-2");
        let rs3 = Location::new("rs-3");
        plan.insert(range("u1", "", "g"), rs2.clone(), RangeState::steady());
        plan.insert(range("u1", "g", "m"), rs3.clone(), RangeState::steady());
        plan.insert(range("u1", "m", ""), rs2.clone(), RangeState::steady());

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.locations().len(), 2);
        assert_eq!(plan.ranges_for(&rs2).len(), 2);
        assert_eq!(plan.location_of_row(&TableId::new("u1", 1), "k"), Some(&rs3));

        // Re-inserting a range reroutes it rather than duplicating it.
        plan.insert(range("u1", "g", "m"), rs2.clone(), RangeState::steady());
        assert_eq!(plan.len(), 3);
        assert!(plan.ranges_for(&rs3).is_empty());
    }

    #[test]
    fn iteration_is_ordered_by_range() {
        let mut plan = ReceiverPlan::default();
        let rs = Location::new("rs-2");
        plan.insert(range("u1", "m", "z"), rs.clone(), RangeState::steady());
        plan.insert(range("u1", "", "g"), rs.clone(), RangeState::steady());
        plan.insert(range("u1", "g", "m"), rs, RangeState::steady());

        let ends: Vec<String> = plan
            .iter()
            .map(|(range, _)| range.range.end_row.clone())
            .collect();
        assert_eq!(ends, vec!["g", "m", "z"]);
    }
}
