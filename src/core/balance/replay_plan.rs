// src/core/balance/replay_plan.rs

//! The replay plan: fragment id -> the server that will replay it.

use crate::core::types::{FragmentId, Location};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ReplayPlan {
    entries: BTreeMap<FragmentId, Location>,
}

impl ReplayPlan {
    /// Assigns (or reassigns) a fragment to a replay location.
    pub fn insert(&mut self, fragment: FragmentId, location: Location) {
        self.entries.insert(fragment, location);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fragments(&self) -> Vec<FragmentId> {
        self.entries.keys().copied().collect()
    }

    pub fn fragments_for(&self, location: &Location) -> Vec<FragmentId> {
        self.entries
            .iter()
            .filter(|(_, loc)| *loc == location)
            .map(|(fragment, _)| *fragment)
            .collect()
    }

    pub fn locations(&self) -> BTreeSet<Location> {
        self.entries.values().cloned().collect()
    }

    pub fn location_of(&self, fragment: FragmentId) -> Option<&Location> {
        self.entries.get(&fragment)
    }

    /// Removes every fragment assigned to `location`, returning the removed
    /// fragment ids.
    pub fn drain_location(&mut self, location: &Location) -> Vec<FragmentId> {
        let drained = self.fragments_for(location);
        for fragment in &drained {
            self.entries.remove(fragment);
        }
        drained
    }
}
