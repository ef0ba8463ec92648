//! Pool Module
//!
//! Provisioning of the node's storage pool: a kernel LVM volume group or
//! an SPDK lvstore, built idempotently from a [`StorageStack`](crate::config::StorageStack).

pub mod artifacts;
pub mod builder;
pub mod engine;
mod lvstore;

pub use artifacts::{cleanup_artifacts, Artifact, ArtifactLedger, ArtifactRecord, CleanupReport};
pub use builder::{BuildOutcome, PoolBuilder, PoolBuilderDeps, DEFAULT_BLOCK_SIZE};
pub use engine::LvmPoolEngine;
