//! Hardware Discovery Module
//!
//! Discovers NVMe namespace devices on Linux systems.

pub mod nvme;

pub use nvme::*;
