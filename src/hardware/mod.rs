//! Hardware Module
//!
//! Host-facing adapters for the domain ports: command execution, kernel
//! modules, PCI driver binding, NVMe discovery, loop devices and LVM.

pub mod discovery;
pub mod exec;
pub mod kmod;
pub mod loopdev;
pub mod lvm;
pub mod pci;

pub use discovery::*;
pub use exec::{run_checked, CommandExec, CommandOutput, ShellExec, ShellExecRef};
pub use kmod::KmodUtil;
pub use loopdev::{loop_device_path, HostLoopDevices};
pub use lvm::LvmUtil;
pub use pci::{PciUtil, NVME_DRIVER_NAME, VFIO_PCI_DRIVER_NAME};
