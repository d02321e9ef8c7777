// src/core/master/recover_ranges.rs

//! The per-range-type recovery sub-operation.
//!
//! Substates: INITIAL -> PHANTOM_LOAD -> REPLAY_FRAGMENTS -> PREPARE ->
//! COMMIT -> ACKNOWLEDGE -> DONE. At the head of every state except DONE the
//! operation first gates on quorum (parking itself until enough servers are
//! connected) and then on plan freshness: if the balance plan authority
//! moved forward, the plan is re-read and the operation restarts at INITIAL.
//! There is no partial rollback; retry is always "restart from the top with
//! a fresh plan snapshot", which is safe because every destination-side step
//! is idempotent.

use super::MasterContext;
use crate::core::TesseraError;
use crate::core::balance::RecoveryPlan;
use crate::core::metalog::{Entity, RecoverRangesState, RecoverServerRangesEntity};
use crate::core::protocol::WireError;
use crate::core::types::{Location, QualifiedRange, RangeType};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct OperationRecoverRanges {
    entity_id: u64,
    location: Location,
    range_type: RangeType,
    attempt: u32,
    plan_generation: u32,
    plan: Option<RecoveryPlan>,
    state: RecoverRangesState,
}

impl OperationRecoverRanges {
    pub fn new(entity_id: u64, location: Location, range_type: RangeType) -> Self {
        Self {
            entity_id,
            location,
            range_type,
            attempt: 0,
            plan_generation: 0,
            plan: None,
            state: RecoverRangesState::Initial,
        }
    }

    pub fn from_entity(entity: RecoverServerRangesEntity) -> Self {
        Self {
            entity_id: entity.id,
            location: entity.location,
            range_type: entity.range_type,
            attempt: entity.attempt,
            plan_generation: 0,
            plan: None,
            state: entity.state,
        }
    }

    pub fn entity_id(&self) -> u64 {
        self.entity_id
    }

    pub fn range_type(&self) -> RangeType {
        self.range_type
    }

    pub fn is_done(&self) -> bool {
        self.state == RecoverRangesState::Done
    }

    pub fn state(&self) -> RecoverRangesState {
        self.state
    }

    pub fn plan_generation(&self) -> u32 {
        self.plan_generation
    }

    pub fn to_entity(&self) -> RecoverServerRangesEntity {
        RecoverServerRangesEntity {
            id: self.entity_id,
            location: self.location.clone(),
            range_type: self.range_type,
            attempt: self.attempt,
            state: self.state,
        }
    }

    /// Runs the state machine forward until it completes, parks (quorum), or
    /// decides to wait for the next scheduler tick.
    pub async fn execute(&mut self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        loop {
            if self.state == RecoverRangesState::Done {
                return Ok(());
            }

            // Quorum gate: the only backpressure in the protocol.
            if !ctx
                .rsc_manager
                .has_quorum(ctx.config.failover.quorum_percentage)
            {
                info!(
                    "RecoverRanges {} type={}: below quorum, parked",
                    self.location, self.range_type
                );
                return Ok(());
            }

            // Plan freshness: a bumped generation (another server died, a
            // destination was withdrawn) invalidates the in-flight phase.
            if self.plan.is_none() || self.plan_generation != ctx.bpa.generation() {
                match ctx.bpa.copy_recovery_plan(&self.location, self.range_type) {
                    Some((plan, generation)) => {
                        info!(
                            "RecoverRanges {} type={}: new plan at generation {} ({} ranges)",
                            self.location,
                            self.range_type,
                            generation,
                            plan.receiver_plan.len()
                        );
                        self.plan = Some(plan);
                        self.plan_generation = generation;
                        if self.state != RecoverRangesState::Initial {
                            self.state = RecoverRangesState::Initial;
                            self.persist(ctx).await?;
                        }
                    }
                    None => {
                        // The whole plan is gone; nothing left to recover.
                        self.state = RecoverRangesState::Done;
                        self.persist(ctx).await?;
                        return Ok(());
                    }
                }
            }

            match self.state {
                RecoverRangesState::Initial => {
                    if self.plan.as_ref().is_none_or(|p| p.receiver_plan.is_empty()) {
                        info!(
                            "Plan for {} type={} is empty, nothing to do",
                            self.location, self.range_type
                        );
                        self.state = RecoverRangesState::Done;
                        self.persist(ctx).await?;
                        return Ok(());
                    }
                    self.state = RecoverRangesState::PhantomLoad;
                    self.persist(ctx).await?;
                }
                RecoverRangesState::PhantomLoad => {
                    if !self.phantom_load_ranges(ctx).await? {
                        // A destination was withdrawn; re-enter with the
                        // bumped plan generation.
                        continue;
                    }
                    self.state = RecoverRangesState::ReplayFragments;
                    self.persist(ctx).await?;
                }
                RecoverRangesState::ReplayFragments => {
                    if !self.replay_fragments(ctx).await? {
                        self.state = RecoverRangesState::Initial;
                        self.persist(ctx).await?;
                        return Ok(());
                    }
                    self.state = RecoverRangesState::Prepare;
                    self.persist(ctx).await?;
                }
                RecoverRangesState::Prepare => match self.prepare_to_commit(ctx).await {
                    Ok(true) => {
                        self.state = RecoverRangesState::Commit;
                        self.persist(ctx).await?;
                    }
                    Ok(false) => return Ok(()),
                    Err(TesseraError::PhantomRangeMapNotFound(loc)) => {
                        // The destination lost its in-memory map; reload it.
                        warn!("{} lost its phantom map, restarting at PHANTOM_LOAD", loc);
                        self.state = RecoverRangesState::PhantomLoad;
                        self.persist(ctx).await?;
                    }
                    Err(e) => return Err(e),
                },
                RecoverRangesState::Commit => match self.commit(ctx).await {
                    Ok(true) => {
                        self.state = RecoverRangesState::Acknowledge;
                        self.persist(ctx).await?;
                    }
                    Ok(false) => return Ok(()),
                    Err(TesseraError::PhantomRangeMapNotFound(loc)) => {
                        warn!("{} lost its phantom map, restarting at PHANTOM_LOAD", loc);
                        self.state = RecoverRangesState::PhantomLoad;
                        self.persist(ctx).await?;
                    }
                    Err(e) => return Err(e),
                },
                RecoverRangesState::Acknowledge => {
                    if !self.acknowledge(ctx).await? {
                        return Ok(());
                    }
                    info!(
                        "RecoverRanges complete for {} type={} attempt={}",
                        self.location, self.range_type, self.attempt
                    );
                    self.state = RecoverRangesState::Done;
                    self.persist(ctx).await?;
                    return Ok(());
                }
                RecoverRangesState::Done => return Ok(()),
            }
        }
    }

    /// Asks every destination to phantom-load its share of the ranges.
    /// Returns false when a destination was withdrawn and the plan must be
    /// re-read.
    async fn phantom_load_ranges(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        let plan = self.plan.as_ref().expect("plan checked at head");
        let fragments = plan.replay_plan.fragments();
        for dest in plan.receiver_plan.locations() {
            let (ranges, states) = plan.receiver_plan.ranges_and_states_for(&dest);
            info!(
                "Issue phantom_load for {} ranges to {} ({})",
                ranges.len(),
                dest,
                self.range_type
            );
            match ctx
                .rs_client
                .phantom_load(
                    &dest,
                    &self.location,
                    self.plan_generation,
                    fragments.clone(),
                    ranges,
                    states,
                )
                .await
            {
                Ok(()) => {}
                Err(TesseraError::RangesAlreadyLive(_)) => {
                    ctx.bpa
                        .remove_from_replay_plan(
                            &self.location,
                            self.range_type,
                            &dest,
                            ctx.config.failover.readd_withdrawn_destinations,
                        )
                        .await?;
                    return Ok(false);
                }
                Err(e) => {
                    error!("phantom_load to {} failed: {}", dest, e);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Kicks off commit-log replay on every replay destination and waits for
    /// the counter. The destinations, not the coordinator, read the fragments
    /// and stream key/value batches to the eventual receivers.
    async fn replay_fragments(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        self.attempt += 1;
        let plan = self.plan.as_ref().expect("plan checked at head");
        let counter = ctx
            .recovery_state
            .create_replay_counter(self.entity_id, self.attempt);

        for dest in plan.replay_plan.locations() {
            let fragments = plan.replay_plan.fragments_for(&dest);
            counter.add(1);
            info!(
                "Issue replay_fragments for {} fragments to {} ({})",
                fragments.len(),
                dest,
                self.range_type
            );
            if let Err(e) = ctx
                .rs_client
                .replay_fragments(
                    &dest,
                    self.entity_id,
                    self.attempt,
                    &self.location,
                    self.range_type,
                    self.plan_generation,
                    fragments.clone(),
                    plan.receiver_plan.clone(),
                    ctx.config.failover.timeout,
                )
                .await
            {
                error!("replay_fragments to {} failed: {}", dest, e);
                counter.set_error(&fragments, WireError::from(&e));
            }
        }

        let success = counter
            .wait_for_completion(ctx.config.failover.timeout)
            .await;
        ctx.recovery_state.erase_replay_counter(self.entity_id);
        if !success {
            error!(
                "Commit log replay failed for {} type={}",
                self.location, self.range_type
            );
        }
        Ok(success)
    }

    /// Tells destinations to merge fragment data into their phantom ranges
    /// and link transfer logs; waits for the asynchronous completions.
    async fn prepare_to_commit(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        let plan = self.plan.as_ref().expect("plan checked at head");
        let future = ctx.recovery_state.prepare_future(self.entity_id);
        let locations = plan.receiver_plan.locations();
        future.register_locations(locations.iter().cloned());

        for dest in &locations {
            let ranges = plan.receiver_plan.ranges_for(dest);
            info!(
                "Issue phantom_prepare_ranges for {} ranges to {} ({})",
                ranges.len(),
                dest,
                self.range_type
            );
            if let Err(e) = ctx
                .rs_client
                .phantom_prepare_ranges(
                    dest,
                    self.entity_id,
                    &self.location,
                    self.plan_generation,
                    ranges,
                )
                .await
            {
                error!("phantom_prepare_ranges to {} failed: {}", dest, e);
            }
        }

        match future.wait_for_completion(ctx.config.failover.timeout).await {
            Ok(()) => {
                ctx.recovery_state.erase_prepare_future(self.entity_id);
                Ok(true)
            }
            Err(TesseraError::PhantomRangeMapNotFound(loc)) => {
                ctx.recovery_state.erase_prepare_future(self.entity_id);
                Err(TesseraError::PhantomRangeMapNotFound(loc))
            }
            Err(_) => Ok(false),
        }
    }

    /// Tells destinations to flip the ranges live; waits for completions.
    async fn commit(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        let plan = self.plan.as_ref().expect("plan checked at head");
        let future = ctx.recovery_state.commit_future(self.entity_id);
        let locations = plan.receiver_plan.locations();
        future.register_locations(locations.iter().cloned());

        for dest in &locations {
            let ranges = plan.receiver_plan.ranges_for(dest);
            info!(
                "Issue phantom_commit_ranges for {} ranges to {}",
                ranges.len(),
                dest
            );
            if let Err(e) = ctx
                .rs_client
                .phantom_commit_ranges(
                    dest,
                    self.entity_id,
                    &self.location,
                    self.plan_generation,
                    ranges,
                )
                .await
            {
                error!("phantom_commit_ranges to {} failed: {}", dest, e);
            }
        }

        match future.wait_for_completion(ctx.config.failover.timeout).await {
            Ok(()) => {
                ctx.recovery_state.erase_commit_future(self.entity_id);
                Ok(true)
            }
            Err(TesseraError::PhantomRangeMapNotFound(loc)) => {
                ctx.recovery_state.erase_commit_future(self.entity_id);
                Err(TesseraError::PhantomRangeMapNotFound(loc))
            }
            Err(_) => Ok(false),
        }
    }

    /// Collects per-range acknowledge results and shrinks the authority's
    /// receiver plan for every range that reported OK.
    async fn acknowledge(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        let plan = self.plan.as_ref().expect("plan checked at head");
        let mut success = true;
        let mut acknowledged: Vec<QualifiedRange> = Vec::new();

        for dest in plan.receiver_plan.locations() {
            let ranges = plan.receiver_plan.ranges_for(&dest);
            info!(
                "Issue acknowledge_load for {} ranges to {}",
                ranges.len(),
                dest
            );
            match ctx.rs_client.acknowledge_load(&dest, ranges).await {
                Ok(results) => {
                    for (range, result) in results {
                        match result {
                            None => acknowledged.push(range),
                            Some(e) => {
                                error!("Problem acknowledging load for {}: {:?}", range, e)
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("acknowledge_load to {} failed: {}", dest, e);
                    success = false;
                }
            }
        }

        if !acknowledged.is_empty() {
            ctx.bpa
                .remove_from_receiver_plan(&self.location, self.range_type, &acknowledged)
                .await?;
        }
        Ok(success)
    }

    async fn persist(&self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        ctx.mml_writer
            .record_state(&Entity::RecoverServerRanges(self.to_entity()))
            .await
    }
}
