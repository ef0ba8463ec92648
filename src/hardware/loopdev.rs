//! Backing Files and Loop Devices
//!
//! Physical volumes without a real device are backed by a sparse file
//! attached to `/dev/loop<index>`.

use crate::domain::ports::LoopDeviceUtility;
use crate::error::{Error, Result};
use crate::hardware::exec::ShellExecRef;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Deterministic loop device path for the PV at `index`
pub fn loop_device_path(index: usize) -> String {
    format!("/dev/loop{}", index)
}

/// [`LoopDeviceUtility`] backed by the local filesystem and `losetup`
pub struct HostLoopDevices {
    exec: ShellExecRef,
    sysfs_root: PathBuf,
}

impl HostLoopDevices {
    pub fn new(exec: ShellExecRef, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            sysfs_root: sysfs_root.into(),
        }
    }

    fn backing_file_attr(&self, loop_path: &str) -> Result<PathBuf> {
        let name = Path::new(loop_path)
            .file_name()
            .ok_or_else(|| Error::device(loop_path, "not a loop device path"))?;
        Ok(self
            .sysfs_root
            .join("block")
            .join(name)
            .join("loop/backing_file"))
    }
}

#[async_trait]
impl LoopDeviceUtility for HostLoopDevices {
    async fn path_exists(&self, path: &str) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| Error::device(path, format!("cannot stat: {}", e)))
    }

    async fn is_block_device(&self, path: &str) -> Result<bool> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::device(path, format!("cannot stat: {}", e)))?;
        Ok(meta.file_type().is_block_device())
    }

    async fn file_len(&self, path: &str) -> Result<u64> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::device(path, format!("cannot stat: {}", e)))?;
        Ok(meta.len())
    }

    async fn loop_backing_file(&self, loop_path: &str) -> Result<Option<String>> {
        let attr = self.backing_file_attr(loop_path)?;
        match tokio::fs::read_to_string(&attr).await {
            Ok(backing) => Ok(Some(backing.trim_end().to_string())),
            // the attribute only exists while the device is bound
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::device(
                loop_path,
                format!("cannot read {}: {}", attr.display(), e),
            )),
        }
    }

    async fn create_sparse_file(&self, path: &str, size: u64) -> Result<()> {
        info!("creating {} byte file {}", size, path);
        let file = tokio::fs::File::create(path).await?;
        file.set_len(size).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn attach_loop_device(&self, loop_path: &str, file_path: &str) -> Result<()> {
        info!("attaching {} to {}", file_path, loop_path);
        let out = self
            .exec
            .exec_cmd("losetup", &[loop_path, file_path])
            .await?;
        if !out.success() {
            return Err(Error::device(
                loop_path,
                format!("losetup {} failed: {}", file_path, out.combined()),
            ));
        }
        Ok(())
    }

    async fn detach_loop_device(&self, loop_path: &str) -> Result<()> {
        info!("detaching {}", loop_path);
        let out = self.exec.exec_cmd("losetup", &["-d", loop_path]).await?;
        if !out.success() {
            return Err(Error::device(
                loop_path,
                format!("losetup -d failed: {}", out.combined()),
            ));
        }
        Ok(())
    }
}
