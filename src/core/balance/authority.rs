// src/core/balance/authority.rs

//! The Balance Plan Authority: the single source of truth for "where will
//! this range live next?".
//!
//! Recovery, load balancing and range splits all consult the authority before
//! assigning a destination, which is what keeps them from issuing conflicting
//! destinations for the same range. Every mutation bumps the generation and
//! rewrites the authority's metalog entity in full, so outside readers always
//! observe either the pre-mutation or the post-mutation plan.

use super::RecoveryPlan;
use crate::core::TesseraError;
use crate::core::commitlog::reader::list_fragment_ids;
use crate::core::dfs::Dfs;
use crate::core::master::connection_manager::RangeServerConnectionManager;
use crate::core::metalog::{BalancePlanAuthorityEntity, Entity, MetalogWriter};
use crate::core::types::{
    Location, QualifiedRange, RangeMoveSpec, RangeSpec, RangeState, RangeType, TableId,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

struct AuthorityState {
    generation: u32,
    plans: BTreeMap<Location, Vec<Option<RecoveryPlan>>>,
    moves: BTreeMap<(String, RangeSpec), RangeMoveSpec>,
}

impl AuthorityState {
    fn to_entity(&self, id: u64) -> BalancePlanAuthorityEntity {
        BalancePlanAuthorityEntity {
            id,
            generation: self.generation,
            plans: self
                .plans
                .iter()
                .map(|(loc, plans)| (loc.clone(), plans.clone()))
                .collect(),
            moves: self.moves.values().cloned().collect(),
        }
    }
}

pub struct BalancePlanAuthority {
    dfs: Arc<dyn Dfs>,
    toplevel_dir: String,
    rsc_manager: Arc<RangeServerConnectionManager>,
    mml_writer: Arc<MetalogWriter>,
    entity_id: u64,
    state: Mutex<AuthorityState>,
}

impl BalancePlanAuthority {
    /// Creates the authority, seeding it from a recovered metalog entity when
    /// one exists, and records the initial state otherwise.
    pub async fn new(
        dfs: Arc<dyn Dfs>,
        toplevel_dir: impl Into<String>,
        rsc_manager: Arc<RangeServerConnectionManager>,
        mml_writer: Arc<MetalogWriter>,
        recovered: Option<BalancePlanAuthorityEntity>,
    ) -> Result<Arc<Self>, TesseraError> {
        let (entity_id, state, fresh) = match recovered {
            Some(entity) => (
                entity.id,
                AuthorityState {
                    generation: entity.generation,
                    plans: entity.plans.into_iter().collect(),
                    moves: entity
                        .moves
                        .into_iter()
                        .map(|m| (m.move_key(), m))
                        .collect(),
                },
                false,
            ),
            None => (
                mml_writer.next_entity_id(),
                AuthorityState {
                    generation: 0,
                    plans: BTreeMap::new(),
                    moves: BTreeMap::new(),
                },
                true,
            ),
        };
        let authority = Arc::new(Self {
            dfs,
            toplevel_dir: toplevel_dir.into(),
            rsc_manager,
            mml_writer,
            entity_id,
            state: Mutex::new(state),
        });
        if fresh {
            authority.persist_current().await?;
        }
        Ok(authority)
    }

    pub fn generation(&self) -> u32 {
        self.state.lock().generation
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().plans.is_empty()
    }

    /// Appends a move to the in-flight set. A single (table, range) can be
    /// the subject of at most one move at a time.
    pub async fn register_move(&self, spec: RangeMoveSpec) -> Result<(), TesseraError> {
        let entity = {
            let mut state = self.state.lock();
            let key = spec.move_key();
            if state.moves.contains_key(&key) {
                return Err(TesseraError::DuplicateMove(QualifiedRange::new(
                    spec.table.clone(),
                    spec.range.clone(),
                )));
            }
            info!(
                "Registered move of {}{} to {}",
                spec.table.id, spec.range, spec.dest_location
            );
            state.moves.insert(key, spec);
            state.generation += 1;
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    /// The already-registered destination for a range, or a fresh round-robin
    /// pick over the connected servers. The fresh pick is deliberately not
    /// persisted.
    pub fn get_balance_destination(&self, table: &TableId, range: &RangeSpec) -> Option<Location> {
        let state = self.state.lock();
        let key = (table.id.clone(), range.clone());
        match state.moves.get(&key) {
            Some(spec) => Some(spec.dest_location.clone()),
            None => self.rsc_manager.next_available_server(),
        }
    }

    /// Removes a completed (or failed) move from the in-flight set.
    pub async fn move_complete(
        &self,
        table: &TableId,
        range: &RangeSpec,
        error: Option<String>,
    ) -> Result<(), TesseraError> {
        let entity = {
            let mut state = self.state.lock();
            let key = (table.id.clone(), range.clone());
            match state.moves.remove(&key) {
                Some(_) => {
                    if let Some(err) = error {
                        warn!("Move of {}{} completed with error: {}", table.id, range, err);
                    }
                }
                None => return Ok(()),
            }
            state.generation += 1;
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    /// Builds the recovery plan for a newly failed server. Atomically:
    /// reroutes every existing plan off the failed location, builds the new
    /// per-type plans round-robin over the connected servers, drops in-flight
    /// moves that pointed at the failed location, bumps the generation and
    /// persists.
    pub async fn create_recovery_plan(
        &self,
        failed: &Location,
        ranges_by_type: [Vec<(QualifiedRange, RangeState)>; 4],
    ) -> Result<(), TesseraError> {
        // Fragment listing per range type happens outside the state lock.
        let mut fragments_by_type = Vec::with_capacity(4);
        for range_type in RangeType::ALL {
            let log_dir = format!(
                "{}/servers/{}/log/{}",
                self.toplevel_dir,
                failed,
                range_type.log_dir_name()
            );
            fragments_by_type.push(list_fragment_ids(&self.dfs, &log_dir).await?);
        }

        let entity = {
            let mut state = self.state.lock();

            // Already recovering: a second failure report must not reset the
            // in-progress plan.
            if state.plans.contains_key(failed) {
                return Ok(());
            }

            info!("Creating recovery plan for {}", failed);
            let connected: Vec<Location> = self
                .rsc_manager
                .connected_servers()
                .into_iter()
                .filter(|loc| loc != failed)
                .collect();

            // Reroute existing plans that still target the failed server.
            for plans in state.plans.values_mut() {
                for plan in plans.iter_mut().flatten() {
                    Self::reroute_location(plan, failed, &connected);
                }
            }

            // Build the new per-type plans.
            let mut new_plans: Vec<Option<RecoveryPlan>> = Vec::with_capacity(4);
            for (range_type, (ranges, fragments)) in RangeType::ALL
                .into_iter()
                .zip(ranges_by_type.into_iter().zip(fragments_by_type))
            {
                if ranges.is_empty() {
                    new_plans.push(None);
                    continue;
                }
                let mut plan = RecoveryPlan::new(range_type);
                let mut picker = connected.iter().cycle();
                for (range, range_state) in ranges {
                    if let Some(dest) = picker.next() {
                        plan.receiver_plan.insert(range, dest.clone(), range_state);
                    }
                }
                let mut picker = connected.iter().cycle();
                for fragment in fragments {
                    if let Some(dest) = picker.next() {
                        plan.replay_plan.insert(fragment, dest.clone());
                    }
                }
                new_plans.push(Some(plan));
            }

            // In-flight moves destined for the dead server are void.
            state.moves.retain(|_, spec| &spec.dest_location != failed);

            state.plans.insert(failed.clone(), new_plans);
            state.generation += 1;
            info!(
                "Recovery plan for {} installed at generation {}",
                failed, state.generation
            );
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    /// Called when ACKNOWLEDGE has succeeded for all four range types.
    pub async fn remove_recovery_plan(&self, location: &Location) -> Result<(), TesseraError> {
        let entity = {
            let mut state = self.state.lock();
            if state.plans.remove(location).is_none() {
                return Ok(());
            }
            state.generation += 1;
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    /// Snapshot read of one per-type plan, together with the generation it
    /// was taken at.
    pub fn copy_recovery_plan(
        &self,
        location: &Location,
        range_type: RangeType,
    ) -> Option<(RecoveryPlan, u32)> {
        let state = self.state.lock();
        let plans = state.plans.get(location)?;
        let plan = plans
            .get(range_type.index())
            .and_then(|p| p.clone())
            .unwrap_or_else(|| RecoveryPlan::new(range_type));
        Some((plan, state.generation))
    }

    /// A destination reported its ranges already live: withdraw it from the
    /// plan. Its replay assignments are always rerouted to the remaining
    /// connected servers; its receiver entries are rerouted only when
    /// `readd_destinations` is set, and dropped (treated as already
    /// recovered) otherwise.
    pub async fn remove_from_replay_plan(
        &self,
        failed: &Location,
        range_type: RangeType,
        destination: &Location,
        readd_destinations: bool,
    ) -> Result<(), TesseraError> {
        let entity = {
            let mut state = self.state.lock();
            let connected: Vec<Location> = self
                .rsc_manager
                .connected_servers()
                .into_iter()
                .filter(|loc| loc != failed && loc != destination)
                .collect();
            let Some(plan) = state
                .plans
                .get_mut(failed)
                .and_then(|plans| plans.get_mut(range_type.index()))
                .and_then(|p| p.as_mut())
            else {
                return Ok(());
            };

            info!(
                "Withdrawing {} from the {} recovery plan of {}",
                destination, range_type, failed
            );
            let fragments = plan.replay_plan.drain_location(destination);
            let mut picker = connected.iter().cycle();
            for fragment in fragments {
                if let Some(dest) = picker.next() {
                    plan.replay_plan.insert(fragment, dest.clone());
                }
            }

            let withdrawn = plan.receiver_plan.drain_location(destination);
            if readd_destinations {
                let mut picker = connected.iter().cycle();
                for (range, range_state) in withdrawn {
                    if let Some(dest) = picker.next() {
                        plan.receiver_plan.insert(range, dest.clone(), range_state);
                    }
                }
            }

            state.generation += 1;
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    /// Shrinks the receiver plan after per-range ACKNOWLEDGE succeeds.
    pub async fn remove_from_receiver_plan(
        &self,
        failed: &Location,
        range_type: RangeType,
        ranges: &[QualifiedRange],
    ) -> Result<(), TesseraError> {
        let entity = {
            let mut state = self.state.lock();
            let Some(plan) = state
                .plans
                .get_mut(failed)
                .and_then(|plans| plans.get_mut(range_type.index()))
                .and_then(|p| p.as_mut())
            else {
                return Ok(());
            };
            for range in ranges {
                plan.receiver_plan.remove(range);
            }
            state.generation += 1;
            state.to_entity(self.entity_id)
        };
        self.persist(entity).await
    }

    fn reroute_location(plan: &mut RecoveryPlan, away_from: &Location, connected: &[Location]) {
        let fragments = plan.replay_plan.drain_location(away_from);
        let mut picker = connected.iter().cycle();
        for fragment in fragments {
            if let Some(dest) = picker.next() {
                plan.replay_plan.insert(fragment, dest.clone());
            }
        }
        let ranges = plan.receiver_plan.drain_location(away_from);
        let mut picker = connected.iter().cycle();
        for (range, state) in ranges {
            if let Some(dest) = picker.next() {
                plan.receiver_plan.insert(range, dest.clone(), state);
            }
        }
    }

    async fn persist_current(&self) -> Result<(), TesseraError> {
        let entity = self.state.lock().to_entity(self.entity_id);
        self.persist(entity).await
    }

    async fn persist(&self, entity: BalancePlanAuthorityEntity) -> Result<(), TesseraError> {
        self.mml_writer
            .record_state(&Entity::BalancePlanAuthority(entity))
            .await
    }
}
