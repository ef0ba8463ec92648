//! Domain Ports - Core trait definitions for pool provisioning
//!
//! These traits define the boundaries between the provisioning logic and
//! the host: kernel modules, PCI driver bindings, NVMe enumeration, loop
//! devices, LVM tooling and the SPDK storage engine. Production adapters
//! shell out or speak JSON-RPC; tests substitute in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Pool Descriptors
// =============================================================================

/// Volume group as reported by the kernel LVM layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroup {
    pub name: String,
    pub uuid: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub extent_size_bytes: u64,
    pub pv_count: u32,
    pub lv_count: u32,
}

/// SPDK logical volume store descriptor
///
/// `bytes` is always `cluster_size * total_data_cluster`; the only
/// constructor is [`SpdkLvStore::from_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpdkLvStore {
    pub name: String,
    pub uuid: String,
    pub base_bdev: String,
    pub cluster_size: u64,
    pub total_data_cluster: u64,
    pub block_size: u64,
    bytes: u64,
}

impl SpdkLvStore {
    pub fn from_info(info: &LvStoreInfo) -> Self {
        Self {
            name: info.name.clone(),
            uuid: info.uuid.clone(),
            base_bdev: info.base_bdev.clone(),
            cluster_size: info.cluster_size,
            total_data_cluster: info.total_data_clusters,
            block_size: info.block_size,
            bytes: info.cluster_size * info.total_data_clusters,
        }
    }

    /// Total capacity in bytes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// What a successful provisioning call produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PoolDescriptor {
    Lvm(VolumeGroup),
    Lvs(SpdkLvStore),
}

impl PoolDescriptor {
    pub fn name(&self) -> &str {
        match self {
            PoolDescriptor::Lvm(vg) => &vg.name,
            PoolDescriptor::Lvs(lvs) => &lvs.name,
        }
    }
}

// =============================================================================
// Storage Engine Types
// =============================================================================

/// A bdev as listed by `bdev_get_bdevs`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bdev {
    pub name: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub num_blocks: u64,
}

/// An lvstore as listed by `bdev_lvol_get_lvstores`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvStoreInfo {
    pub uuid: String,
    pub name: String,
    pub base_bdev: String,
    pub total_data_clusters: u64,
    #[serde(default)]
    pub free_clusters: u64,
    pub block_size: u64,
    pub cluster_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioBdevCreateRequest {
    pub bdev_name: String,
    pub dev_path: String,
    pub block_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MallocBdevCreateRequest {
    pub name: String,
    pub block_size: u32,
    pub num_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UringBdevCreateRequest {
    pub bdev_name: String,
    pub dev_path: String,
    pub block_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UringBdevResizeRequest {
    pub bdev_name: String,
    pub target_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLvStoreRequest {
    pub bdev_name: String,
    pub lvs_name: String,
}

/// Composite lvstore over several NVMe devices
///
/// `devices` holds PCI addresses or namespace device paths depending on
/// the operation it is passed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachNvmeRequest {
    pub devices: Vec<String>,
    /// Name of the raid0 bdev assembled over the devices
    pub raid_name: String,
    pub lvs_name: String,
}

// =============================================================================
// Pool Query Port
// =============================================================================

/// Answers whether a kernel volume group exists
#[async_trait]
pub trait PoolEngine: Send + Sync {
    /// Returns [`Error::VgNotFound`](crate::Error::VgNotFound) when absent
    async fn pool_info(&self, name: &str) -> Result<VolumeGroup>;
}

// =============================================================================
// Storage Engine Port
// =============================================================================

/// Idempotent bdev and lvstore operations against the SPDK target
///
/// Absence is signalled with [`Error::NoSuchDevice`](crate::Error::NoSuchDevice).
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Find an lvstore whose name or base bdev equals `key`
    async fn get_lvstore(&self, key: &str) -> Result<LvStoreInfo>;

    async fn create_lvstore(&self, req: CreateLvStoreRequest) -> Result<LvStoreInfo>;

    async fn bdev_get_bdevs(&self, name: &str) -> Result<Vec<Bdev>>;

    async fn create_aio_bdev(&self, req: AioBdevCreateRequest) -> Result<()>;

    async fn delete_aio_bdev(&self, name: &str) -> Result<()>;

    async fn create_mem_bdev(&self, req: MallocBdevCreateRequest) -> Result<()>;

    async fn delete_mem_bdev(&self, name: &str) -> Result<()>;

    async fn create_uring_bdev(&self, req: UringBdevCreateRequest) -> Result<()>;

    async fn delete_uring_bdev(&self, name: &str) -> Result<()>;

    async fn resize_uring_bdev(&self, req: UringBdevResizeRequest) -> Result<()>;

    /// Attach NVMe controllers by PCI address and build an lvstore over them
    async fn create_lvstore_from_nvme_ids(&self, req: AttachNvmeRequest) -> Result<LvStoreInfo>;

    /// Build an lvstore over existing uring bdevs named after device paths
    async fn create_lvstore_from_nvme_device_paths(
        &self,
        req: AttachNvmeRequest,
    ) -> Result<LvStoreInfo>;
}

// =============================================================================
// Host Device Ports
// =============================================================================

/// Kernel module state
#[async_trait]
pub trait KmodUtility: Send + Sync {
    async fn has_kmod(&self, name: &str) -> Result<bool>;

    async fn probe_kmod(&self, name: &str) -> Result<()>;
}

/// PCI driver bindings for NVMe controllers
#[async_trait]
pub trait PciUtility: Send + Sync {
    /// PCI addresses of all NVMe controllers, e.g. `0000:03:00.0`
    async fn list_nvme_ids(&self) -> Result<Vec<String>>;

    /// Whether `id` is currently bound to `driver`
    async fn check_nvme_existence(&self, id: &str, driver: &str) -> Result<bool>;

    async fn unbind_nvme(&self, id: &str, driver: &str) -> Result<()>;

    /// Vendor and device id, e.g. `8086 0953`
    async fn get_nvme_type_id(&self, id: &str) -> Result<String>;

    /// Register a vendor/device id with `driver` so it claims every match
    async fn bind_nvme_by_type(&self, type_id: &str, driver: &str) -> Result<()>;
}

/// NVMe namespace discovery
#[async_trait]
pub trait NvmeUtility: Send + Sync {
    async fn list_nvme_paths(&self) -> Result<Vec<String>>;
}

/// Backing files and loop devices
#[async_trait]
pub trait LoopDeviceUtility: Send + Sync {
    async fn path_exists(&self, path: &str) -> Result<bool>;

    /// Whether `path` is a block device; `Error::Device` if it is missing
    async fn is_block_device(&self, path: &str) -> Result<bool>;

    /// Length in bytes of the file at `path`
    async fn file_len(&self, path: &str) -> Result<u64>;

    /// File currently backing `loop_path`, `None` when it is unbound
    async fn loop_backing_file(&self, loop_path: &str) -> Result<Option<String>>;

    /// Create a sparse file of exactly `size` bytes
    async fn create_sparse_file(&self, path: &str, size: u64) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn attach_loop_device(&self, loop_path: &str, file_path: &str) -> Result<()>;

    async fn detach_loop_device(&self, loop_path: &str) -> Result<()>;
}

/// LVM command wrapper
#[async_trait]
pub trait LvmUtility: Send + Sync {
    async fn create_pvs(&self, paths: &[String]) -> Result<()>;

    async fn create_vg(&self, name: &str, paths: &[String]) -> Result<()>;

    /// Returns [`Error::VgNotFound`](crate::Error::VgNotFound) when absent
    async fn get_vg(&self, name: &str) -> Result<VolumeGroup>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type PoolEngineRef = Arc<dyn PoolEngine>;
pub type StorageEngineRef = Arc<dyn StorageEngine>;
pub type KmodUtilityRef = Arc<dyn KmodUtility>;
pub type PciUtilityRef = Arc<dyn PciUtility>;
pub type NvmeUtilityRef = Arc<dyn NvmeUtility>;
pub type LoopDeviceUtilityRef = Arc<dyn LoopDeviceUtility>;
pub type LvmUtilityRef = Arc<dyn LvmUtility>;
