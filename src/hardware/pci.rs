//! PCI Driver Binding
//!
//! Moves NVMe controllers between the kernel `nvme` driver and `vfio-pci`
//! through sysfs, so SPDK can own them from user space.

use crate::domain::ports::PciUtility;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

pub const NVME_DRIVER_NAME: &str = "nvme";
pub const VFIO_PCI_DRIVER_NAME: &str = "vfio-pci";

/// PCI class code for NVM Express mass storage controllers
const NVME_CLASS_CODE: &str = "0x010802";

// =============================================================================
// PCI Utility
// =============================================================================

/// sysfs-backed [`PciUtility`]
pub struct PciUtil {
    sysfs_root: PathBuf,
}

impl PciUtil {
    /// `sysfs_root` is normally `/sys`; tests point it at a temp tree
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices")
    }

    fn driver_dir(&self, driver: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers").join(driver)
    }

    async fn write_attr(path: &Path, value: &str, action: &str) -> Result<()> {
        debug!("writing {:?} to {}", value, path.display());
        tokio::fs::write(path, value)
            .await
            .map_err(|e| Error::tool(action, format!("{}: {}", path.display(), e)))
    }

    async fn read_attr(path: &Path) -> Result<String> {
        let value = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::tool("pci read", format!("{}: {}", path.display(), e)))?;
        Ok(value.trim().to_string())
    }
}

#[async_trait]
impl PciUtility for PciUtil {
    async fn list_nvme_ids(&self) -> Result<Vec<String>> {
        let pattern = format!("{}/*/class", self.devices_dir().display());
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::tool("pci list", e.to_string()))?;

        let mut ids = Vec::new();
        for entry in entries {
            let class_path = entry.map_err(|e| Error::tool("pci list", e.to_string()))?;
            if Self::read_attr(&class_path).await? != NVME_CLASS_CODE {
                continue;
            }
            if let Some(id) = class_path
                .parent()
                .and_then(|dir| dir.file_name())
                .map(|name| name.to_string_lossy().to_string())
            {
                ids.push(id);
            }
        }

        ids.sort();
        debug!("found NVMe controllers {:?}", ids);
        Ok(ids)
    }

    async fn check_nvme_existence(&self, id: &str, driver: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.driver_dir(driver).join(id))
            .await
            .unwrap_or(false))
    }

    async fn unbind_nvme(&self, id: &str, driver: &str) -> Result<()> {
        info!("unbinding PCI device {} from {}", id, driver);
        Self::write_attr(&self.driver_dir(driver).join("unbind"), id, "pci unbind").await
    }

    async fn get_nvme_type_id(&self, id: &str) -> Result<String> {
        let dev = self.devices_dir().join(id);
        let vendor = Self::read_attr(&dev.join("vendor")).await?;
        let device = Self::read_attr(&dev.join("device")).await?;

        Ok(format!(
            "{} {}",
            vendor.trim_start_matches("0x"),
            device.trim_start_matches("0x")
        ))
    }

    async fn bind_nvme_by_type(&self, type_id: &str, driver: &str) -> Result<()> {
        info!("binding PCI type {} to {}", type_id, driver);
        Self::write_attr(&self.driver_dir(driver).join("new_id"), type_id, "pci bind").await
    }
}
