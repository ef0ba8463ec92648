//! LVM Utility
//!
//! Thin wrapper over `pvcreate`, `vgcreate` and `vgs`.

use crate::domain::ports::{LvmUtility, VolumeGroup};
use crate::error::{Error, Result};
use crate::hardware::exec::{run_checked, ShellExecRef};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

const VGS_FIELDS: &str = "vg_name,vg_uuid,vg_size,vg_free,vg_extent_size,pv_count,lv_count";

// =============================================================================
// vgs JSON Report
// =============================================================================

#[derive(Debug, Deserialize)]
struct VgsReport {
    report: Vec<VgsSection>,
}

#[derive(Debug, Deserialize)]
struct VgsSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

/// vgs reports every field as a string
#[derive(Debug, Deserialize)]
struct VgRow {
    vg_name: String,
    #[serde(default)]
    vg_uuid: String,
    #[serde(default)]
    vg_size: String,
    #[serde(default)]
    vg_free: String,
    #[serde(default)]
    vg_extent_size: String,
    #[serde(default)]
    pv_count: String,
    #[serde(default)]
    lv_count: String,
}

fn parse_num<T: std::str::FromStr + Default>(value: &str) -> T {
    value.trim().parse().unwrap_or_default()
}

impl From<VgRow> for VolumeGroup {
    fn from(row: VgRow) -> Self {
        VolumeGroup {
            name: row.vg_name,
            uuid: row.vg_uuid,
            total_bytes: parse_num(&row.vg_size),
            free_bytes: parse_num(&row.vg_free),
            extent_size_bytes: parse_num(&row.vg_extent_size),
            pv_count: parse_num(&row.pv_count),
            lv_count: parse_num(&row.lv_count),
        }
    }
}

fn parse_vgs(output: &[u8], name: &str) -> Result<VolumeGroup> {
    let report: VgsReport = serde_json::from_slice(output)?;
    report
        .report
        .into_iter()
        .flat_map(|section| section.vg)
        .find(|row| row.vg_name == name)
        .map(VolumeGroup::from)
        .ok_or_else(|| Error::VgNotFound {
            name: name.to_string(),
        })
}

// =============================================================================
// LVM Utility
// =============================================================================

pub struct LvmUtil {
    exec: ShellExecRef,
}

impl LvmUtil {
    pub fn new(exec: ShellExecRef) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl LvmUtility for LvmUtil {
    async fn create_pvs(&self, paths: &[String]) -> Result<()> {
        info!("creating PVs on {:?}", paths);
        let args: Vec<&str> = paths.iter().map(String::as_str).collect();
        run_checked(self.exec.as_ref(), "pvcreate", &args).await?;
        Ok(())
    }

    async fn create_vg(&self, name: &str, paths: &[String]) -> Result<()> {
        info!("creating VG {} on {:?}", name, paths);
        let mut args = vec![name];
        args.extend(paths.iter().map(String::as_str));
        run_checked(self.exec.as_ref(), "vgcreate", &args).await?;
        Ok(())
    }

    async fn get_vg(&self, name: &str) -> Result<VolumeGroup> {
        let out = self
            .exec
            .exec_cmd(
                "vgs",
                &[
                    "--reportformat",
                    "json",
                    "--units",
                    "b",
                    "--nosuffix",
                    "-o",
                    VGS_FIELDS,
                    name,
                ],
            )
            .await?;

        if !out.success() {
            let diag = out.combined();
            if diag.contains("not found") {
                debug!("vg {} not found", name);
                return Err(Error::VgNotFound {
                    name: name.to_string(),
                });
            }
            return Err(Error::tool("vgs", diag));
        }

        parse_vgs(&out.stdout, name)
    }
}
