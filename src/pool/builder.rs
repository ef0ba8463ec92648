//! Pool Builder
//!
//! Brings the configured pool into existence, idempotently. Each call runs
//!
//! ```text
//! Querying ──found──────────────────────────────────────────────▶ Done
//!    │
//!    └─not found─▶ ProvisioningBaseDevice ─▶ ProvisioningPoolStore ─▶ Done
//! ```
//!
//! and any error returns immediately. Nothing is persisted between calls,
//! and concurrent builds of the same pool must be serialized by the caller.

use crate::config::{AgentConfig, PciSettleConfig, PhysicalVolumeSpec, PoolMode, StorageStack};
use crate::domain::ports::{
    KmodUtilityRef, LoopDeviceUtilityRef, LvmUtilityRef, NvmeUtilityRef, PciUtilityRef,
    PoolDescriptor, PoolEngineRef, StorageEngineRef, VolumeGroup,
};
use crate::error::{Error, Result};
use crate::hardware::{
    loop_device_path, CommandExec, HostLoopDevices, KmodUtil, LvmUtil, NvmeUtil, PciUtil,
    ShellExecRef,
};
use crate::pool::artifacts::{cleanup_artifacts, Artifact, ArtifactLedger, CleanupReport};
use crate::pool::engine::LvmPoolEngine;
use crate::spdk::{SpdkService, UnixSocketConnector};
use std::sync::Arc;
use tracing::{error, info};

/// Block size of every bdev the agent creates
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

// =============================================================================
// Dependencies
// =============================================================================

/// Collaborators the builder composes
#[derive(Clone)]
pub struct PoolBuilderDeps {
    pub engine: PoolEngineRef,
    pub spdk: StorageEngineRef,
    pub kmod: KmodUtilityRef,
    pub pci: PciUtilityRef,
    pub nvme: NvmeUtilityRef,
    pub loops: LoopDeviceUtilityRef,
    pub lvm: LvmUtilityRef,
}

impl PoolBuilderDeps {
    /// Production wiring: real commands, sysfs and the SPDK socket
    pub fn host(config: &AgentConfig) -> Self {
        let exec: ShellExecRef = Arc::new(CommandExec::new());
        let lvm: LvmUtilityRef = Arc::new(LvmUtil::new(exec.clone()));
        let loops: LoopDeviceUtilityRef = Arc::new(HostLoopDevices::new(
            exec.clone(),
            config.sysfs_root.clone(),
        ));

        Self {
            engine: Arc::new(LvmPoolEngine::new(lvm.clone())),
            spdk: Arc::new(SpdkService::new(
                Arc::new(UnixSocketConnector::new(config.spdk_socket.clone())),
                loops.clone(),
            )),
            kmod: Arc::new(KmodUtil::new(exec.clone())),
            pci: Arc::new(PciUtil::new(config.sysfs_root.clone())),
            nvme: Arc::new(NvmeUtil::new(exec)),
            loops,
            lvm,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Result of one attempt together with what it created
#[derive(Debug)]
pub struct BuildOutcome {
    pub result: Result<PoolDescriptor>,
    pub artifacts: ArtifactLedger,
}

/// Immutable provisioning request plus its collaborators
pub struct PoolBuilder {
    pub(crate) mode: PoolMode,
    pub(crate) stack: StorageStack,
    pub(crate) settle: PciSettleConfig,
    pub(crate) deps: PoolBuilderDeps,
}

impl PoolBuilder {
    pub fn new(
        mode: PoolMode,
        stack: StorageStack,
        settle: PciSettleConfig,
        deps: PoolBuilderDeps,
    ) -> Self {
        Self {
            mode,
            stack,
            settle,
            deps,
        }
    }

    pub fn from_config(config: &AgentConfig, deps: PoolBuilderDeps) -> Self {
        Self::new(
            config.mode,
            config.storage.clone(),
            config.pci_settle,
            deps,
        )
    }

    /// Provision the pool if missing and describe it
    pub async fn build(&self) -> Result<PoolDescriptor> {
        self.build_tracked().await.result
    }

    /// Like [`build`](Self::build), also returning the created artifacts
    pub async fn build_tracked(&self) -> BuildOutcome {
        let mut artifacts = ArtifactLedger::new();

        let result = match self.mode {
            PoolMode::KernelLvm => self.build_lvm(&mut artifacts).await.map(PoolDescriptor::Lvm),
            PoolMode::SpdkLvStore => self
                .build_spdk_lvs(&mut artifacts)
                .await
                .map(PoolDescriptor::Lvs),
        };

        if let Err(e) = &result {
            error!(
                "building {} pool {:?} failed after creating {} artifacts: {}",
                self.mode,
                self.stack.pooling.name,
                artifacts.len(),
                e
            );
        }

        BuildOutcome { result, artifacts }
    }

    /// Best-effort removal of artifacts from a failed attempt
    pub async fn cleanup(&self, artifacts: &ArtifactLedger) -> CleanupReport {
        cleanup_artifacts(
            artifacts,
            self.deps.spdk.as_ref(),
            self.deps.loops.as_ref(),
        )
        .await
    }

    // =========================================================================
    // Kernel LVM
    // =========================================================================

    async fn build_lvm(&self, artifacts: &mut ArtifactLedger) -> Result<VolumeGroup> {
        let name = &self.stack.pooling.name;

        match self.deps.engine.pool_info(name).await {
            Ok(vg) => {
                info!("successfully read vg info: {:?}", vg);
                return Ok(vg);
            }
            Err(e) if e.is_not_found_vg() => {}
            Err(e) => return Err(e),
        }

        info!("creating LVM VG {} from {:?}", name, self.stack.pvs);
        let mut pvs = Vec::with_capacity(self.stack.pvs.len());
        for (idx, pv) in self.stack.pvs.iter().enumerate() {
            pvs.push(self.resolve_pv(idx, pv, artifacts).await?);
        }

        if pvs.is_empty() {
            return Err(Error::Configuration(format!(
                "no physical volumes to create vg {}",
                name
            )));
        }

        info!("create vg {} by pvs {:?}", name, pvs);
        self.deps.lvm.create_pvs(&pvs).await?;
        self.deps.lvm.create_vg(name, &pvs).await?;

        let vg = self.deps.engine.pool_info(name).await?;
        info!("successfully created vg {:?}", vg);
        Ok(vg)
    }

    /// Create `path` as a sparse file of `size` bytes, or check that an
    /// existing file has exactly that size. A `size` of 0 accepts any
    /// existing file.
    pub(crate) async fn ensure_backing_file(
        &self,
        path: &str,
        size: u64,
        artifacts: &mut ArtifactLedger,
    ) -> Result<()> {
        if self.deps.loops.path_exists(path).await? {
            let len = self.deps.loops.file_len(path).await?;
            if size > 0 && len != size {
                return Err(Error::device(
                    path,
                    format!("existing file is {} bytes, configured size is {}", len, size),
                ));
            }
            info!("reusing existing backing file {}", path);
            return Ok(());
        }

        if size == 0 {
            return Err(Error::Configuration(format!(
                "no size given to create backing file {}",
                path
            )));
        }
        self.deps.loops.create_sparse_file(path, size).await?;
        artifacts.record(Artifact::File {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Device path for the PV at `idx`, creating its backing file and loop
    /// device when it has no existing device
    async fn resolve_pv(
        &self,
        idx: usize,
        pv: &PhysicalVolumeSpec,
        artifacts: &mut ArtifactLedger,
    ) -> Result<String> {
        if let Some(dev) = pv.device_path.as_deref().filter(|p| !p.is_empty()) {
            if self.deps.loops.path_exists(dev).await? {
                info!("pv device {} exists", dev);
                return Ok(dev.to_string());
            }
        }

        let (file, size) = match (pv.file_path.as_deref(), pv.size_bytes) {
            (Some(file), Some(size)) if !file.is_empty() && size > 0 => (file, size),
            _ => {
                return Err(Error::Configuration(format!(
                    "invalid config of PV {}: {:?}",
                    idx, pv
                )))
            }
        };

        self.ensure_backing_file(file, size, artifacts).await?;

        let loop_dev = loop_device_path(idx);
        match self.deps.loops.loop_backing_file(&loop_dev).await? {
            Some(backing) if backing == file => {
                info!("{} is already bound to {}", loop_dev, file);
            }
            Some(backing) => {
                return Err(Error::device(
                    &loop_dev,
                    format!("bound to {} instead of {}", backing, file),
                ))
            }
            None => {
                info!("binding {} to {}", file, loop_dev);
                self.deps.loops.attach_loop_device(&loop_dev, file).await?;
                artifacts.record(Artifact::LoopDevice {
                    path: loop_dev.clone(),
                    backing_file: file.to_string(),
                });
            }
        }

        Ok(loop_dev)
    }
}
