//! SPDK RPC Client
//!
//! Typed wrappers for the bdev and lvol RPC methods the agent uses. Field
//! names match SPDK's JSON parameter names exactly.

use crate::domain::ports::{Bdev, LvStoreInfo};
use crate::error::{Error, Result, SPDK_ENODEV};
use crate::spdk::jsonrpc::RpcTransportRef;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct BdevGetBdevsReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Shared shape of `bdev_aio_create` and `bdev_uring_create`
#[derive(Debug, Clone, Serialize)]
pub struct BdevFileCreateReq {
    pub name: String,
    pub filename: String,
    pub block_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BdevMallocCreateReq {
    pub name: String,
    pub num_blocks: u64,
    pub block_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BdevNameReq {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BdevUringResizeReq {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LvolGetLvstoresReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lvs_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LvolCreateLvstoreReq {
    pub bdev_name: String,
    pub lvs_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BdevNvmeAttachControllerReq {
    pub name: String,
    pub trtype: String,
    pub traddr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BdevRaidCreateReq {
    pub name: String,
    pub raid_level: String,
    pub strip_size_kb: u32,
    pub base_bdevs: Vec<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Maps SPDK's `-ENODEV` reply to the not-found sentinel for `name`
fn enodev_as_not_found(err: Error, name: &str) -> Error {
    match err {
        Error::Rpc { code, ref message, .. }
            if code == SPDK_ENODEV || message.contains("No such device") =>
        {
            Error::NoSuchDevice {
                name: name.to_string(),
            }
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct SpdkClient {
    transport: RpcTransportRef,
}

impl SpdkClient {
    pub fn new(transport: RpcTransportRef) -> Self {
        Self { transport }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.transport.call(method, Some(params)).await?;
        debug!("rpc {} result: {}", method, result);
        Ok(serde_json::from_value(result)?)
    }

    pub async fn bdev_get_bdevs(&self, req: BdevGetBdevsReq) -> Result<Vec<Bdev>> {
        let name = req.name.clone().unwrap_or_default();
        self.call("bdev_get_bdevs", &req)
            .await
            .map_err(|e| enodev_as_not_found(e, &name))
    }

    pub async fn bdev_aio_create(&self, req: BdevFileCreateReq) -> Result<String> {
        self.call("bdev_aio_create", &req).await
    }

    pub async fn bdev_aio_delete(&self, req: BdevNameReq) -> Result<bool> {
        self.call("bdev_aio_delete", &req).await
    }

    pub async fn bdev_malloc_create(&self, req: BdevMallocCreateReq) -> Result<String> {
        self.call("bdev_malloc_create", &req).await
    }

    pub async fn bdev_malloc_delete(&self, req: BdevNameReq) -> Result<bool> {
        self.call("bdev_malloc_delete", &req).await
    }

    pub async fn bdev_uring_create(&self, req: BdevFileCreateReq) -> Result<String> {
        self.call("bdev_uring_create", &req).await
    }

    pub async fn bdev_uring_delete(&self, req: BdevNameReq) -> Result<bool> {
        self.call("bdev_uring_delete", &req).await
    }

    pub async fn bdev_uring_resize(&self, req: BdevUringResizeReq) -> Result<bool> {
        self.call("bdev_uring_resize", &req).await
    }

    pub async fn bdev_lvol_get_lvstores(
        &self,
        req: LvolGetLvstoresReq,
    ) -> Result<Vec<LvStoreInfo>> {
        let name = req
            .lvs_name
            .clone()
            .or_else(|| req.uuid.clone())
            .unwrap_or_default();
        self.call("bdev_lvol_get_lvstores", &req)
            .await
            .map_err(|e| enodev_as_not_found(e, &name))
    }

    /// Returns the new lvstore's UUID
    pub async fn bdev_lvol_create_lvstore(&self, req: LvolCreateLvstoreReq) -> Result<String> {
        let bdev = req.bdev_name.clone();
        self.call("bdev_lvol_create_lvstore", &req)
            .await
            .map_err(|e| enodev_as_not_found(e, &bdev))
    }

    /// Returns the namespace bdev names created for the controller
    pub async fn bdev_nvme_attach_controller(
        &self,
        req: BdevNvmeAttachControllerReq,
    ) -> Result<Vec<String>> {
        self.call("bdev_nvme_attach_controller", &req).await
    }

    pub async fn bdev_raid_create(&self, req: BdevRaidCreateReq) -> Result<bool> {
        self.call("bdev_raid_create", &req).await
    }
}
