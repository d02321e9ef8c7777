// src/core/protocol/mod.rs

//! The wire protocol owned by the core: a fixed header {command, id,
//! timeout_ms, flags} followed by a bincode-encoded payload.

pub mod codec;
pub mod messages;

pub use codec::RpcCodec;
pub use messages::{Envelope, RpcBody, RpcRequest, RpcResponse, WireError};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Command codes carried in the header. Stable within a deployment, not a
/// cross-version compatibility surface.
pub mod command {
    pub const PHANTOM_LOAD: u16 = 1;
    pub const PHANTOM_UPDATE: u16 = 2;
    pub const PHANTOM_PREPARE_RANGES: u16 = 3;
    pub const PHANTOM_COMMIT_RANGES: u16 = 4;
    pub const ACKNOWLEDGE_LOAD: u16 = 5;
    pub const REPLAY_FRAGMENTS: u16 = 6;
    pub const PHANTOM_PREPARE_COMPLETE: u16 = 7;
    pub const PHANTOM_COMMIT_COMPLETE: u16 = 8;
    pub const REPLAY_COMPLETE: u16 = 9;
    pub const REPLAY_STATUS: u16 = 10;
    pub const REGISTER_SERVER: u16 = 11;

    pub const ASSIGN_FRAGMENTS: u16 = 20;
    pub const FINISHED_FRAGMENT: u16 = 21;
    pub const GET_RECEIVER_LIST: u16 = 22;
    pub const NOTIFY_SCHEMA_UPDATE: u16 = 23;
    pub const APPLY_SCHEMA_UPDATE: u16 = 24;
    pub const SLAVE_UPDATE: u16 = 25;

    pub const STATUS: u16 = 30;
    pub const SHUTDOWN: u16 = 31;

    pub const RESPONSE: u16 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RpcHeader {
    pub command: u16,
    pub id: u64,
    pub timeout_ms: u32,
    pub flags: u16,
}

impl RpcHeader {
    pub fn request(command: u16, id: u64, timeout_ms: u32) -> Self {
        Self {
            command,
            id,
            timeout_ms,
            flags: 0,
        }
    }

    pub fn response(id: u64) -> Self {
        Self {
            command: command::RESPONSE,
            id,
            timeout_ms: 0,
            flags: 0,
        }
    }
}
