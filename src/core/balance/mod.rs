// src/core/balance/mod.rs

//! Balance plans: who receives which range, who replays which fragment.

pub mod authority;
pub mod receiver_plan;
pub mod replay_plan;

pub use authority::BalancePlanAuthority;
pub use receiver_plan::ReceiverPlan;
pub use replay_plan::ReplayPlan;

use crate::core::types::RangeType;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The recovery plan for one failed server and one range type: where every
/// range goes (receiver plan) and who replays every commit-log fragment
/// (replay plan).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RecoveryPlan {
    pub range_type: RangeType,
    pub receiver_plan: ReceiverPlan,
    pub replay_plan: ReplayPlan,
}

impl RecoveryPlan {
    pub fn new(range_type: RangeType) -> Self {
        Self {
            range_type,
            receiver_plan: ReceiverPlan::default(),
            replay_plan: ReplayPlan::default(),
        }
    }
}
