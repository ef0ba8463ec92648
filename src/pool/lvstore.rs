//! SPDK LVStore Provisioning
//!
//! Ensures the configured base bdev exists, then builds the lvstore over
//! it. Composite (RAID) stores take one of two sub-paths:
//!
//! - PCI passthrough: rebind every NVMe controller to vfio-pci and let the
//!   engine attach them by PCI address
//! - io_uring: wrap every discovered NVMe namespace in a uring bdev

use crate::config::{BaseDeviceSpec, BdevType, RaidVariant};
use crate::domain::ports::{
    AioBdevCreateRequest, AttachNvmeRequest, CreateLvStoreRequest, LvStoreInfo,
    MallocBdevCreateRequest, SpdkLvStore, UringBdevCreateRequest,
};
use crate::error::{Error, Result};
use crate::hardware::kmod::{VFIO_IOMMU_KMOD, VFIO_PCI_KMOD};
use crate::hardware::{NVME_DRIVER_NAME, VFIO_PCI_DRIVER_NAME};
use crate::pool::artifacts::{Artifact, ArtifactLedger};
use crate::pool::builder::{PoolBuilder, DEFAULT_BLOCK_SIZE};
use crate::spdk::bdev_name_for_path;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

impl PoolBuilder {
    pub(crate) async fn build_spdk_lvs(
        &self,
        artifacts: &mut ArtifactLedger,
    ) -> Result<SpdkLvStore> {
        let bdev = self.stack.base_bdev()?;

        if let Some(info) = self.find_lvstore(bdev).await? {
            info!("found existing lvstore: {:?}", info);
            return Ok(SpdkLvStore::from_info(&info));
        }

        let info = match bdev.raid_variant() {
            Some(RaidVariant::PciPassthrough) => self.build_pci_passthrough(bdev).await?,
            Some(RaidVariant::IoUring) => self.build_uring_raid(bdev, artifacts).await?,
            None => {
                self.ensure_base_bdev(bdev, artifacts).await?;
                self.deps
                    .spdk
                    .create_lvstore(CreateLvStoreRequest {
                        bdev_name: bdev.name.clone(),
                        lvs_name: self.stack.pooling.name.clone(),
                    })
                    .await?
            }
        };

        let lvs = SpdkLvStore::from_info(&info);
        info!("successfully created lvstore {:?}", lvs);
        Ok(lvs)
    }

    /// Existing lvstore over the base bdev, falling back to the pool name
    async fn find_lvstore(&self, bdev: &BaseDeviceSpec) -> Result<Option<LvStoreInfo>> {
        for key in [bdev.name.as_str(), self.stack.pooling.name.as_str()] {
            match self.deps.spdk.get_lvstore(key).await {
                Ok(info) => return Ok(Some(info)),
                Err(e) if e.is_not_found_device() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn bdev_exists(&self, name: &str) -> Result<bool> {
        match self.deps.spdk.bdev_get_bdevs(name).await {
            Ok(list) => Ok(list.iter().any(|b| b.name == name)),
            Err(e) if e.is_not_found_device() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Base Device
    // =========================================================================

    async fn ensure_base_bdev(
        &self,
        bdev: &BaseDeviceSpec,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        if self.bdev_exists(&bdev.name).await? {
            info!("base bdev {} already exists", bdev.name);
            return Ok(());
        }

        match bdev.r#type {
            BdevType::Aio => self.create_aio(bdev, artifacts).await,
            BdevType::Uring => {
                let path = required_file_path(bdev)?;
                self.create_uring(&bdev.name, path, artifacts).await
            }
            BdevType::Mem => self.create_mem(bdev, artifacts).await,
            BdevType::Raid => Err(Error::Configuration(format!(
                "raid bdev {} is only built by the composite path",
                bdev.name
            ))),
        }
    }

    async fn create_aio(
        &self,
        bdev: &BaseDeviceSpec,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        let path = required_file_path(bdev)?;

        self.ensure_backing_file(path, bdev.size_bytes, artifacts).await?;

        self.deps
            .spdk
            .create_aio_bdev(AioBdevCreateRequest {
                bdev_name: bdev.name.clone(),
                dev_path: path.to_string(),
                block_size: DEFAULT_BLOCK_SIZE,
            })
            .await?;
        artifacts.record(Artifact::Bdev {
            name: bdev.name.clone(),
            bdev_type: BdevType::Aio,
        });
        Ok(())
    }

    /// The backing path must already exist as a block device
    async fn create_uring(
        &self,
        name: &str,
        path: &str,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        if !self.deps.loops.is_block_device(path).await? {
            return Err(Error::device(path, "not a block device"));
        }

        self.deps
            .spdk
            .create_uring_bdev(UringBdevCreateRequest {
                bdev_name: name.to_string(),
                dev_path: path.to_string(),
                block_size: DEFAULT_BLOCK_SIZE,
            })
            .await?;
        artifacts.record(Artifact::Bdev {
            name: name.to_string(),
            bdev_type: BdevType::Uring,
        });
        Ok(())
    }

    async fn create_mem(
        &self,
        bdev: &BaseDeviceSpec,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        let block_size = u64::from(DEFAULT_BLOCK_SIZE);
        if bdev.size_bytes < block_size {
            return Err(Error::Configuration(format!(
                "mem bdev {} size {} is smaller than one {} byte block",
                bdev.name, bdev.size_bytes, block_size
            )));
        }

        self.deps
            .spdk
            .create_mem_bdev(MallocBdevCreateRequest {
                name: bdev.name.clone(),
                block_size: DEFAULT_BLOCK_SIZE,
                num_blocks: bdev.size_bytes / block_size,
            })
            .await?;
        artifacts.record(Artifact::Bdev {
            name: bdev.name.clone(),
            bdev_type: BdevType::Mem,
        });
        Ok(())
    }

    // =========================================================================
    // Composite: PCI Passthrough
    // =========================================================================

    async fn build_pci_passthrough(&self, bdev: &BaseDeviceSpec) -> Result<LvStoreInfo> {
        for kmod in [VFIO_PCI_KMOD, VFIO_IOMMU_KMOD] {
            self.ensure_kmod(kmod).await?;
        }

        let ids = self.deps.pci.list_nvme_ids().await?;
        if ids.is_empty() {
            return Err(Error::Configuration(format!(
                "no NVMe controllers found for raid bdev {}",
                bdev.name
            )));
        }
        info!("found NVMe controllers {:?}", ids);

        // vfio-pci claims controllers by vendor/device id, so all must share one
        let mut type_id: Option<String> = None;
        for id in &ids {
            let this = self.deps.pci.get_nvme_type_id(id).await?;
            match &type_id {
                Some(first) if *first != this => {
                    return Err(Error::Configuration(format!(
                        "NVMe controllers have mixed types {} and {}",
                        first, this
                    )))
                }
                Some(_) => {}
                None => type_id = Some(this),
            }
        }
        let type_id = type_id.unwrap_or_default();

        let mut pending = Vec::new();
        for id in &ids {
            if self.deps.pci.check_nvme_existence(id, NVME_DRIVER_NAME).await? {
                info!("unbinding {} from {}", id, NVME_DRIVER_NAME);
                self.deps.pci.unbind_nvme(id, NVME_DRIVER_NAME).await?;
            }
            if !self
                .deps
                .pci
                .check_nvme_existence(id, VFIO_PCI_DRIVER_NAME)
                .await?
            {
                pending.push(id.clone());
            }
        }

        if !pending.is_empty() {
            info!("binding NVMe type {} to {}", type_id, VFIO_PCI_DRIVER_NAME);
            self.deps
                .pci
                .bind_nvme_by_type(&type_id, VFIO_PCI_DRIVER_NAME)
                .await?;
            self.wait_for_vfio(&ids).await?;
        }

        self.deps
            .spdk
            .create_lvstore_from_nvme_ids(AttachNvmeRequest {
                devices: ids,
                raid_name: bdev.name.clone(),
                lvs_name: self.stack.pooling.name.clone(),
            })
            .await
    }

    async fn ensure_kmod(&self, name: &str) -> Result<()> {
        match self.deps.kmod.has_kmod(name).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!("checking kernel module {} failed: {}", name, e),
        }
        info!("probing kernel module {}", name);
        self.deps.kmod.probe_kmod(name).await
    }

    /// Poll until every controller is bound to vfio-pci
    async fn wait_for_vfio(&self, ids: &[String]) -> Result<()> {
        let timeout = self.settle.timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let mut unbound = Vec::new();
            for id in ids {
                if !self
                    .deps
                    .pci
                    .check_nvme_existence(id, VFIO_PCI_DRIVER_NAME)
                    .await?
                {
                    unbound.push(id.as_str());
                }
            }

            if unbound.is_empty() {
                info!("all NVMe controllers bound to {}", VFIO_PCI_DRIVER_NAME);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("{:?} to bind to {}", unbound, VFIO_PCI_DRIVER_NAME),
                    waited: timeout,
                });
            }
            sleep(self.settle.poll_interval()).await;
        }
    }

    // =========================================================================
    // Composite: io_uring
    // =========================================================================

    async fn build_uring_raid(
        &self,
        bdev: &BaseDeviceSpec,
        artifacts: &mut ArtifactLedger,
    ) -> Result<LvStoreInfo> {
        let paths = self.deps.nvme.list_nvme_paths().await?;
        if paths.is_empty() {
            return Err(Error::Configuration(format!(
                "no NVMe devices found for raid bdev {}",
                bdev.name
            )));
        }
        info!("found NVMe devices {:?}", paths);

        for path in &paths {
            if let Err(e) = self.ensure_nvme_uring_bdev(path, artifacts).await {
                warn!("skipping uring bdev for {}: {}", path, e);
            }
        }

        // every discovered path goes to the store, including skipped ones
        self.deps
            .spdk
            .create_lvstore_from_nvme_device_paths(AttachNvmeRequest {
                devices: paths,
                raid_name: bdev.name.clone(),
                lvs_name: self.stack.pooling.name.clone(),
            })
            .await
    }

    async fn ensure_nvme_uring_bdev(
        &self,
        path: &str,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        let name = bdev_name_for_path(path)?;
        if self.bdev_exists(&name).await? {
            info!("uring bdev {} for {} already exists", name, path);
            return Ok(());
        }
        self.create_uring(&name, path, artifacts).await
    }
}

fn required_file_path(bdev: &BaseDeviceSpec) -> Result<&str> {
    bdev.file_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "{} bdev {} requires filePath",
                bdev.r#type, bdev.name
            ))
        })
}
