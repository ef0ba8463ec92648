//! Kernel Pool Query Engine
//!
//! Answers "does volume group X exist" through the LVM utility.

use crate::domain::ports::{LvmUtilityRef, PoolEngine, VolumeGroup};
use crate::error::Result;
use async_trait::async_trait;

pub struct LvmPoolEngine {
    lvm: LvmUtilityRef,
}

impl LvmPoolEngine {
    pub fn new(lvm: LvmUtilityRef) -> Self {
        Self { lvm }
    }
}

#[async_trait]
impl PoolEngine for LvmPoolEngine {
    async fn pool_info(&self, name: &str) -> Result<VolumeGroup> {
        self.lvm.get_vg(name).await
    }
}
