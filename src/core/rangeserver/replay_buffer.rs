// src/core/rangeserver/replay_buffer.rs

//! Groups replayed key/value pairs per eventual receiver and flushes them as
//! `phantom_update` batches.
//!
//! The replay worker feeds one fragment at a time; a flush happens on every
//! fragment switch so each (range, fragment) pair is delivered in a single
//! batch, which is what makes re-delivery detectable on the receiving side.

use crate::core::TesseraError;
use crate::core::balance::ReceiverPlan;
use crate::core::cell::{CellKey, encode_cell};
use crate::core::comm::CommRegistry;
use crate::core::protocol::{RpcRequest, RpcResponse};
use crate::core::types::{FragmentId, Location, QualifiedRange, TableId};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ReplayBuffer {
    source: Location,
    plan_generation: u32,
    receiver_plan: ReceiverPlan,
    receiver_addrs: HashMap<Location, SocketAddr>,
    registry: Arc<CommRegistry>,
    timeout: Duration,
    current_fragment: FragmentId,
    buffers: HashMap<(Location, QualifiedRange), BytesMut>,
}

impl ReplayBuffer {
    pub fn new(
        source: Location,
        plan_generation: u32,
        receiver_plan: ReceiverPlan,
        receiver_addrs: HashMap<Location, SocketAddr>,
        registry: Arc<CommRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            plan_generation,
            receiver_plan,
            receiver_addrs,
            registry,
            timeout,
            current_fragment: 0,
            buffers: HashMap::new(),
        }
    }

    pub fn set_current_fragment(&mut self, fragment: FragmentId) {
        self.current_fragment = fragment;
    }

    /// Buffers one cell for the receiver of its range. Keys outside every
    /// planned range are dropped (their range was not part of this recovery).
    pub fn add(&mut self, table: &TableId, key: &CellKey, value: &[u8]) {
        let Some((range, entry)) = self
            .receiver_plan
            .iter()
            .find(|(range, _)| range.table.id == table.id && range.range.contains(&key.row))
        else {
            debug!("No receiver planned for row '{}' of {}, dropped", key.row, table.id);
            return;
        };
        let buffer = self
            .buffers
            .entry((entry.location.clone(), range.clone()))
            .or_default();
        encode_cell(buffer, key, value);
    }

    /// Ships every buffered batch as a `phantom_update` for the current
    /// fragment. A receiver replying `FragmentAlreadyProcessed` already has
    /// the batch from an earlier attempt; that is success.
    pub async fn flush(&mut self) -> Result<(), TesseraError> {
        let fragment = self.current_fragment;
        for ((location, range), buffer) in self.buffers.drain() {
            let addr = self
                .receiver_addrs
                .get(&location)
                .copied()
                .ok_or_else(|| TesseraError::Connection(format!("no address for {location}")))?;
            let client = self.registry.get(addr);
            let response = client
                .call(
                    RpcRequest::PhantomUpdate {
                        source: self.source.clone(),
                        plan_generation: self.plan_generation,
                        range: range.clone(),
                        fragment,
                        payload: buffer.to_vec(),
                    },
                    self.timeout,
                )
                .await?;
            match response.into_result() {
                Ok(RpcResponse::Ok) => {}
                Ok(other) => {
                    return Err(TesseraError::Protocol(format!(
                        "unexpected phantom_update response {other:?}"
                    )));
                }
                Err(TesseraError::FragmentAlreadyProcessed(msg)) => {
                    warn!("Fragment {} for {} already processed: {}", fragment, range, msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
