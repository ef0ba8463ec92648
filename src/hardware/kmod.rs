//! Kernel Module Utility
//!
//! Checks `/proc/modules` (and `/sys/module` for built-ins) and loads
//! missing modules with `modprobe`.

use crate::domain::ports::KmodUtility;
use crate::error::Result;
use crate::hardware::exec::{run_checked, ShellExecRef};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Modules required before NVMe controllers can move to vfio-pci
pub const VFIO_PCI_KMOD: &str = "vfio_pci";
pub const VFIO_IOMMU_KMOD: &str = "vfio_iommu_type1";

pub struct KmodUtil {
    exec: ShellExecRef,
    proc_modules: PathBuf,
    sys_module: PathBuf,
}

impl KmodUtil {
    pub fn new(exec: ShellExecRef) -> Self {
        Self::with_paths(exec, "/proc/modules", "/sys/module")
    }

    /// Use alternate procfs/sysfs locations (for testing)
    pub fn with_paths(
        exec: ShellExecRef,
        proc_modules: impl Into<PathBuf>,
        sys_module: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec,
            proc_modules: proc_modules.into(),
            sys_module: sys_module.into(),
        }
    }
}

/// Module names use `_` in procfs regardless of how they were requested
fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

#[async_trait]
impl KmodUtility for KmodUtil {
    async fn has_kmod(&self, name: &str) -> Result<bool> {
        let name = normalize(name);

        let loaded = tokio::fs::read_to_string(&self.proc_modules).await?;
        if loaded
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|module| module == name)
        {
            return Ok(true);
        }

        // built into the kernel
        Ok(tokio::fs::try_exists(self.sys_module.join(&name))
            .await
            .unwrap_or(false))
    }

    async fn probe_kmod(&self, name: &str) -> Result<()> {
        info!("probing kernel module {}", name);
        run_checked(self.exec.as_ref(), "modprobe", &[name]).await?;
        Ok(())
    }
}
