// src/core/replication/mod.rs

//! Cross-cluster asynchronous replication: a per-cluster master that owns
//! fragment assignment, and slaves that stream fragments to remote clusters.
//! Delivery is at-least-once; the cell encoding preserves revisions so
//! re-delivery converges.

pub mod client;
pub mod fragment_worker;
pub mod master;
pub mod slave;

use crate::core::TesseraError;
use serde::{Deserialize, Serialize};

/// The slice of a table schema the replication pipeline cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub id: String,
    pub generation: u32,
    #[serde(default)]
    pub replication_clusters: Vec<String>,
    #[serde(default)]
    pub column_families: Vec<String>,
}

impl TableSchema {
    pub fn from_json(json: &str) -> Result<Self, TesseraError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, TesseraError> {
        Ok(serde_json::to_string(self)?)
    }
}
