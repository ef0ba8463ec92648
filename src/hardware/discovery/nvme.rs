//! NVMe-specific Discovery
//!
//! Enumerates NVMe namespace block devices via `nvme list -o json`.

use crate::domain::ports::NvmeUtility;
use crate::error::{Error, Result};
use crate::hardware::exec::ShellExecRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const NVME_LIST_SHELL: &str = "set -o pipefail; nvme list -o json";

// =============================================================================
// nvme-cli List Structures
// =============================================================================

/// Top-level document printed by `nvme list -o json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NvmeDeviceList {
    #[serde(rename = "Devices", default)]
    pub devices: Vec<NvmeListEntry>,
}

/// One namespace device in the list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NvmeListEntry {
    #[serde(default)]
    pub name_space: u64,
    pub device_path: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub model_number: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(rename = "MaximumLBA", default)]
    pub maximum_lba: u64,
    #[serde(default)]
    pub physical_size: u64,
    #[serde(default)]
    pub sector_size: u64,
}

// =============================================================================
// NVMe Discovery
// =============================================================================

/// [`NvmeUtility`] backed by nvme-cli
pub struct NvmeUtil {
    exec: ShellExecRef,
}

impl NvmeUtil {
    pub fn new(exec: ShellExecRef) -> Self {
        Self { exec }
    }

    /// Parse `nvme list` JSON into device paths, in listed order
    pub fn parse_device_paths(output: &[u8]) -> Result<Vec<String>> {
        let list: NvmeDeviceList = serde_json::from_slice(output).map_err(|e| {
            Error::tool(
                "nvme list",
                format!("JSON parse error: {}: {}", e, String::from_utf8_lossy(output)),
            )
        })?;

        Ok(list.devices.into_iter().map(|d| d.device_path).collect())
    }
}

#[async_trait]
impl NvmeUtility for NvmeUtil {
    async fn list_nvme_paths(&self) -> Result<Vec<String>> {
        let output = self
            .exec
            .exec_cmd("bash", &["-c", NVME_LIST_SHELL])
            .await?;

        if !output.success() {
            return Err(Error::tool("nvme list", output.combined()));
        }

        let paths = Self::parse_device_paths(&output.stdout)?;
        debug!("nvme list found {:?}", paths);
        Ok(paths)
    }
}
