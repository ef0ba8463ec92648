//! Provisioning Artifacts
//!
//! Ordered record of what one provisioning attempt created on the host,
//! and a best-effort compensating cleanup. Provisioning is at-least-once,
//! not transactional: cleanup is offered to the caller, never run
//! implicitly.

use crate::config::BdevType;
use crate::domain::ports::{LoopDeviceUtility, StorageEngine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// A host-side object created during provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Artifact {
    /// Backing file created for a loop device or aio bdev
    File { path: String },
    /// Loop device attached to a backing file
    LoopDevice { path: String, backing_file: String },
    /// Bdev created in the storage engine
    Bdev { name: String, bdev_type: BdevType },
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::File { path } => write!(f, "file {}", path),
            Artifact::LoopDevice { path, backing_file } => {
                write!(f, "loop device {} ({})", path, backing_file)
            }
            Artifact::Bdev { name, bdev_type } => write!(f, "{} bdev {}", bdev_type, name),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
}

/// Artifacts in creation order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArtifactLedger {
    records: Vec<ArtifactRecord>,
}

impl ArtifactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, artifact: Artifact) {
        info!("created {}", artifact);
        self.records.push(ArtifactRecord {
            artifact,
            created_at: Utc::now(),
        });
    }

    pub fn records(&self) -> &[ArtifactRecord] {
        &self.records
    }

    pub fn artifacts(&self) -> impl DoubleEndedIterator<Item = &Artifact> {
        self.records.iter().map(|r| &r.artifact)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of [`cleanup_artifacts`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<Artifact>,
    pub failed: Vec<(Artifact, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove every artifact in reverse creation order, continuing past failures
pub async fn cleanup_artifacts(
    ledger: &ArtifactLedger,
    engine: &dyn StorageEngine,
    loops: &dyn LoopDeviceUtility,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for artifact in ledger.artifacts().rev() {
        let res = match artifact {
            Artifact::Bdev { name, bdev_type } => match bdev_type {
                BdevType::Aio => engine.delete_aio_bdev(name).await,
                BdevType::Uring => engine.delete_uring_bdev(name).await,
                BdevType::Mem => engine.delete_mem_bdev(name).await,
                // composite bdevs are never recorded
                BdevType::Raid => Ok(()),
            },
            Artifact::LoopDevice { path, .. } => loops.detach_loop_device(path).await,
            Artifact::File { path } => loops.remove_file(path).await,
        };

        match res {
            Ok(()) => {
                info!("removed {}", artifact);
                report.removed.push(artifact.clone());
            }
            Err(e) => {
                warn!("failed to remove {}: {}", artifact, e);
                report.failed.push((artifact.clone(), e.to_string()));
            }
        }
    }

    report
}
