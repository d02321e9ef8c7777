// src/core/cluster.rs

//! Cluster identity: the 64-bit id stamped into every commit-log payload
//! block, agreed on once and stored in Hyperspace so every process of the
//! cluster sees the same value.

use crate::core::TesseraError;
use crate::core::hyperspace::{Hyperspace, OpenFlags, SessionId};
use std::sync::Arc;
use tracing::info;

pub struct ClusterIdManager {
    hyperspace: Arc<dyn Hyperspace>,
    session: SessionId,
    master_file: String,
}

impl ClusterIdManager {
    pub fn new(
        hyperspace: Arc<dyn Hyperspace>,
        session: SessionId,
        toplevel_dir: &str,
    ) -> Self {
        Self {
            hyperspace,
            session,
            master_file: format!("{toplevel_dir}/master"),
        }
    }

    /// Returns the cluster id recorded in Hyperspace, seeding it from the
    /// configured value on first use. A configured id that contradicts the
    /// recorded one is a deployment error.
    pub async fn ensure_cluster_id(&self, configured: u64) -> Result<u64, TesseraError> {
        let handle = self
            .hyperspace
            .open(
                self.session,
                &self.master_file,
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .await?;
        let result = match self.hyperspace.attr_get(handle, "cluster_id").await? {
            Some(value) => {
                let stored: u64 = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        TesseraError::Hyperspace("unparsable cluster_id attribute".into())
                    })?;
                if stored != configured {
                    Err(TesseraError::Config(format!(
                        "configured cluster id {configured} contradicts recorded id {stored}"
                    )))
                } else {
                    Ok(stored)
                }
            }
            None => {
                info!("Recording cluster id {} in Hyperspace", configured);
                self.hyperspace
                    .attr_set(handle, "cluster_id", configured.to_string().as_bytes())
                    .await?;
                Ok(configured)
            }
        };
        self.hyperspace.close(handle).await?;
        result
    }
}
