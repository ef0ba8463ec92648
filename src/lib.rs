//! Storage Pool Agent - Node-Local Pool Provisioning
//!
//! Brings a node's storage pool into existence on demand: either a kernel
//! LVM volume group built from devices or loop-mounted files, or an SPDK
//! logical volume store built over a base bdev. Provisioning is
//! idempotent; an existing pool is returned without mutation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            PoolBuilder                               │
//! │        mode ──▶ Kernel LVM path  |  SPDK lvstore path               │
//! ├──────────────────────────────┬──────────────────────────────────────┤
//! │        Host Adapters         │           Storage Engine             │
//! │  ┌────────┐ ┌─────┐ ┌─────┐  │  ┌────────────┐   ┌──────────────┐  │
//! │  │  LVM   │ │Loop │ │Kmod │  │  │SpdkService │──▶│  SpdkClient  │  │
//! │  └────────┘ └─────┘ └─────┘  │  └────────────┘   └──────┬───────┘  │
//! │  ┌────────┐ ┌────────────┐   │                          │          │
//! │  │  PCI   │ │NVMe (cli)  │   │              JSON-RPC over Unix     │
//! │  │ sysfs  │ │ discovery  │   │                  socket             │
//! │  └────────┘ └────────────┘   │                                     │
//! └──────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Pool mode, storage stack and agent configuration
//! - [`domain`]: Port traits and pool descriptors
//! - [`hardware`]: Host adapters (commands, kmod, PCI, NVMe, loop, LVM)
//! - [`spdk`]: SPDK JSON-RPC transport, client and service
//! - [`pool`]: Pool builder, provisioning paths and artifact cleanup
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod pool;
pub mod spdk;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{
    AgentConfig, BaseDeviceSpec, BdevType, PciSettleConfig, PhysicalVolumeSpec, PoolMode,
    PoolingConfig, RaidVariant, StorageStack,
};

pub use domain::ports::{
    PoolDescriptor, PoolEngine, SpdkLvStore, StorageEngine, VolumeGroup,
};

pub use error::{Error, ErrorAction, Result};

pub use pool::{
    Artifact, ArtifactLedger, BuildOutcome, CleanupReport, LvmPoolEngine, PoolBuilder,
    PoolBuilderDeps,
};

pub use spdk::{SpdkService, UnixSocketConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
