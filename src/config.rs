//! Agent Configuration
//!
//! Declarative description of the storage backing the agent should bring
//! into existence: the pooling mode, the physical volumes for a kernel
//! volume group and the base bdev for an SPDK logical volume store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Default SPDK JSON-RPC socket
pub const DEFAULT_SPDK_SOCKET: &str = "/usr/tmp/spdk.sock";

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

// =============================================================================
// Pool Mode
// =============================================================================

/// Backend a pool is provisioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PoolMode {
    /// Kernel LVM volume group
    KernelLvm,
    /// SPDK logical volume store
    SpdkLvStore,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::KernelLvm => "KernelLVM",
            PoolMode::SpdkLvStore => "SpdkLVStore",
        }
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KernelLVM" => Ok(PoolMode::KernelLvm),
            "SpdkLVStore" => Ok(PoolMode::SpdkLvStore),
            other => Err(Error::Configuration(format!("invalid mode {:?}", other))),
        }
    }
}

impl TryFrom<String> for PoolMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PoolMode> for String {
    fn from(mode: PoolMode) -> Self {
        mode.as_str().to_string()
    }
}

// =============================================================================
// Storage Stack
// =============================================================================

/// Identity of the pool to provision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolingConfig {
    /// Pool name, unique per host
    pub name: String,
}

/// One physical volume backing a kernel volume group
///
/// Either references an existing device, or describes a file that is
/// created and attached to a loop device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalVolumeSpec {
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Size of the backing file in bytes
    #[serde(default, rename = "size")]
    pub size_bytes: Option<u64>,
}

/// Base bdev backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdevType {
    Aio,
    Uring,
    Mem,
    Raid,
}

impl std::fmt::Display for BdevType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdevType::Aio => write!(f, "aio"),
            BdevType::Uring => write!(f, "uring"),
            BdevType::Mem => write!(f, "mem"),
            BdevType::Raid => write!(f, "raid"),
        }
    }
}

/// How a composite (multi-NVMe) lvstore is assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidVariant {
    /// Rebind NVMe controllers to vfio-pci and attach them by PCI address
    PciPassthrough,
    /// One io_uring bdev per NVMe namespace device
    IoUring,
}

/// Base bdev an lvstore is built on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseDeviceSpec {
    pub name: String,
    pub r#type: BdevType,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Size in bytes, used by aio backing files and malloc bdevs
    #[serde(default, rename = "size")]
    pub size_bytes: u64,
    /// With `type: uring`, build a composite store over every NVMe namespace
    #[serde(default)]
    pub raid: bool,
}

impl BaseDeviceSpec {
    /// Composite variant for this bdev, if it describes one
    pub fn raid_variant(&self) -> Option<RaidVariant> {
        match self.r#type {
            BdevType::Raid => Some(RaidVariant::PciPassthrough),
            BdevType::Uring if self.raid => Some(RaidVariant::IoUring),
            BdevType::Aio | BdevType::Uring | BdevType::Mem => None,
        }
    }
}

/// Desired storage backing for one pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStack {
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub pvs: Vec<PhysicalVolumeSpec>,
    #[serde(default)]
    pub bdev: Option<BaseDeviceSpec>,
}

impl StorageStack {
    /// Base bdev, required by the SPDK mode
    pub fn base_bdev(&self) -> Result<&BaseDeviceSpec> {
        self.bdev
            .as_ref()
            .ok_or_else(|| Error::Configuration("bdev is required for SpdkLVStore mode".into()))
    }
}

// =============================================================================
// PCI Settle Policy
// =============================================================================

/// Bounded wait for NVMe controllers to appear under vfio-pci
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PciSettleConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl PciSettleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PciSettleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_ms: 5_000,
        }
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub mode: PoolMode,
    pub storage: StorageStack,
    #[serde(default = "default_spdk_socket")]
    pub spdk_socket: PathBuf,
    #[serde(default)]
    pub pci_settle: PciSettleConfig,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_spdk_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SPDK_SOCKET)
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

impl AgentConfig {
    /// Parse a YAML document
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(doc)?;

        // an unknown mode is a configuration error, not a parse error
        if let Some(mode) = value.get("mode").and_then(|m| m.as_str()) {
            mode.parse::<PoolMode>()?;
        }

        Ok(serde_yaml::from_value(value)?)
    }

    /// Load and parse a YAML file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let doc = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&doc)
    }
}
