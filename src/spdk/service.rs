//! SPDK Service
//!
//! Idempotent bdev and lvstore operations on top of [`SpdkClient`]. Every
//! operation re-acquires its connection at entry, so a dropped socket heals
//! on the next call.

use crate::domain::ports::{
    AioBdevCreateRequest, AttachNvmeRequest, Bdev, CreateLvStoreRequest, LoopDeviceUtilityRef,
    LvStoreInfo, MallocBdevCreateRequest, StorageEngine, UringBdevCreateRequest,
    UringBdevResizeRequest,
};
use crate::error::{Error, Result};
use crate::spdk::client::{
    BdevFileCreateReq, BdevGetBdevsReq, BdevMallocCreateReq, BdevNameReq,
    BdevNvmeAttachControllerReq, BdevRaidCreateReq, BdevUringResizeReq, LvolCreateLvstoreReq,
    LvolGetLvstoresReq, SpdkClient,
};
use crate::spdk::jsonrpc::RpcConnectorRef;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const RAID0_STRIP_SIZE_KB: u32 = 64;

pub struct SpdkService {
    connector: RpcConnectorRef,
    host: LoopDeviceUtilityRef,
    cli: Mutex<Option<SpdkClient>>,
}

impl SpdkService {
    pub fn new(connector: RpcConnectorRef, host: LoopDeviceUtilityRef) -> Self {
        Self {
            connector,
            host,
            cli: Mutex::new(None),
        }
    }

    /// Current client, reconnecting if there is none or it has failed
    async fn client(&self) -> Result<SpdkClient> {
        let mut cli = self.cli.lock().await;
        if let Some(client) = cli.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        info!("spdk client is not connected, connecting to spdk socket");
        let client = SpdkClient::new(self.connector.connect().await.map_err(|e| {
            error!("connecting spdk socket failed: {}", e);
            e
        })?);
        *cli = Some(client.clone());
        Ok(client)
    }

    /// Bdevs named `name`; an absent bdev yields an empty list
    async fn list_bdevs_tolerant(client: &SpdkClient, name: &str) -> Result<Vec<Bdev>> {
        match client
            .bdev_get_bdevs(BdevGetBdevsReq {
                name: Some(name.to_string()),
            })
            .await
        {
            Ok(list) => Ok(list),
            Err(e) if e.is_not_found_device() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn bdev_exists(client: &SpdkClient, name: &str) -> Result<bool> {
        Ok(Self::list_bdevs_tolerant(client, name)
            .await?
            .iter()
            .any(|b| b.name == name))
    }

    fn check_deleted(method: &str, name: &str, result: bool) -> Result<()> {
        if !result {
            let err = Error::RpcRejected {
                method: method.to_string(),
                target: name.to_string(),
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    async fn lvstore_by_uuid(client: &SpdkClient, uuid: &str) -> Result<LvStoreInfo> {
        client
            .bdev_lvol_get_lvstores(LvolGetLvstoresReq {
                uuid: Some(uuid.to_string()),
                lvs_name: None,
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoSuchDevice {
                name: uuid.to_string(),
            })
    }

    async fn create_lvstore_with(
        client: &SpdkClient,
        bdev_name: &str,
        lvs_name: &str,
    ) -> Result<LvStoreInfo> {
        info!("creating lvstore {} on bdev {}", lvs_name, bdev_name);
        let uuid = client
            .bdev_lvol_create_lvstore(LvolCreateLvstoreReq {
                bdev_name: bdev_name.to_string(),
                lvs_name: lvs_name.to_string(),
            })
            .await?;
        Self::lvstore_by_uuid(client, &uuid).await
    }

    /// Build the lvstore over `base_bdevs`, striping them first when there
    /// is more than one
    async fn assemble_lvstore(
        client: &SpdkClient,
        base_bdevs: Vec<String>,
        raid_name: &str,
        lvs_name: &str,
    ) -> Result<LvStoreInfo> {
        let base = match base_bdevs.as_slice() {
            [] => {
                return Err(Error::Configuration(
                    "no NVMe devices to build lvstore on".into(),
                ))
            }
            [single] => single.clone(),
            _ => {
                if !Self::bdev_exists(client, raid_name).await? {
                    info!("creating raid0 bdev {} over {:?}", raid_name, base_bdevs);
                    let created = client
                        .bdev_raid_create(BdevRaidCreateReq {
                            name: raid_name.to_string(),
                            raid_level: "raid0".to_string(),
                            strip_size_kb: RAID0_STRIP_SIZE_KB,
                            base_bdevs,
                        })
                        .await?;
                    if !created {
                        return Err(Error::RpcRejected {
                            method: "bdev_raid_create".into(),
                            target: raid_name.to_string(),
                        });
                    }
                }
                raid_name.to_string()
            }
        };

        Self::create_lvstore_with(client, &base, lvs_name).await
    }
}

#[async_trait]
impl StorageEngine for SpdkService {
    async fn get_lvstore(&self, key: &str) -> Result<LvStoreInfo> {
        let client = self.client().await?;
        let list = client
            .bdev_lvol_get_lvstores(LvolGetLvstoresReq::default())
            .await
            .map_err(|e| match e {
                Error::NoSuchDevice { .. } => Error::NoSuchDevice {
                    name: key.to_string(),
                },
                other => other,
            })?;

        list.into_iter()
            .find(|lvs| lvs.name == key || lvs.base_bdev == key)
            .ok_or_else(|| Error::NoSuchDevice {
                name: key.to_string(),
            })
    }

    async fn create_lvstore(&self, req: CreateLvStoreRequest) -> Result<LvStoreInfo> {
        let client = self.client().await?;
        Self::create_lvstore_with(&client, &req.bdev_name, &req.lvs_name).await
    }

    async fn bdev_get_bdevs(&self, name: &str) -> Result<Vec<Bdev>> {
        let client = self.client().await?;
        client
            .bdev_get_bdevs(BdevGetBdevsReq {
                name: Some(name.to_string()),
            })
            .await
    }

    async fn create_aio_bdev(&self, req: AioBdevCreateRequest) -> Result<()> {
        let client = self.client().await?;
        if Self::bdev_exists(&client, &req.bdev_name).await? {
            info!("aio bdev {} already exists", req.bdev_name);
            return Ok(());
        }

        info!("creating aio bdev {} on {}", req.bdev_name, req.dev_path);
        client
            .bdev_aio_create(BdevFileCreateReq {
                name: req.bdev_name,
                filename: req.dev_path,
                block_size: req.block_size,
            })
            .await?;
        Ok(())
    }

    async fn delete_aio_bdev(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        if !Self::bdev_exists(&client, name).await? {
            info!("aio bdev {} is already deleted", name);
            return Ok(());
        }

        let result = client
            .bdev_aio_delete(BdevNameReq {
                name: name.to_string(),
            })
            .await?;
        Self::check_deleted("bdev_aio_delete", name, result)
    }

    async fn create_mem_bdev(&self, req: MallocBdevCreateRequest) -> Result<()> {
        let client = self.client().await?;
        if Self::bdev_exists(&client, &req.name).await? {
            info!("malloc bdev {} already exists", req.name);
            return Ok(());
        }

        info!(
            "creating malloc bdev {} with {} blocks of {} bytes",
            req.name, req.num_blocks, req.block_size
        );
        client
            .bdev_malloc_create(BdevMallocCreateReq {
                name: req.name,
                num_blocks: req.num_blocks,
                block_size: req.block_size,
            })
            .await?;
        Ok(())
    }

    async fn delete_mem_bdev(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        if !Self::bdev_exists(&client, name).await? {
            info!("malloc bdev {} is already deleted", name);
            return Ok(());
        }

        let result = client
            .bdev_malloc_delete(BdevNameReq {
                name: name.to_string(),
            })
            .await?;
        Self::check_deleted("bdev_malloc_delete", name, result)
    }

    async fn create_uring_bdev(&self, req: UringBdevCreateRequest) -> Result<()> {
        let client = self.client().await?;

        info!("creating uring bdev, req is {:?}", req);
        if !self.host.path_exists(&req.dev_path).await? {
            return Err(Error::device(&req.dev_path, "device path does not exist"));
        }

        if Self::bdev_exists(&client, &req.bdev_name).await? {
            info!(
                "devpath {} bdev {} already exists",
                req.dev_path, req.bdev_name
            );
            return Ok(());
        }

        client
            .bdev_uring_create(BdevFileCreateReq {
                name: req.bdev_name.clone(),
                filename: req.dev_path,
                block_size: req.block_size,
            })
            .await?;

        info!("created bdev {}", req.bdev_name);
        Ok(())
    }

    async fn delete_uring_bdev(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        if !Self::bdev_exists(&client, name).await? {
            info!("uring bdev {} is already deleted", name);
            return Ok(());
        }

        let result = client
            .bdev_uring_delete(BdevNameReq {
                name: name.to_string(),
            })
            .await?;
        Self::check_deleted("bdev_uring_delete", name, result)
    }

    async fn resize_uring_bdev(&self, req: UringBdevResizeRequest) -> Result<()> {
        let client = self.client().await?;

        let list = client
            .bdev_get_bdevs(BdevGetBdevsReq {
                name: Some(req.bdev_name.clone()),
            })
            .await
            .map_err(|e| {
                error!("uring bdev {} lookup failed: {}", req.bdev_name, e);
                e
            })?;
        if list.is_empty() {
            return Err(Error::NoSuchDevice {
                name: req.bdev_name,
            });
        }

        let result = client
            .bdev_uring_resize(BdevUringResizeReq {
                name: req.bdev_name.clone(),
                size: req.target_size,
            })
            .await?;
        if !result {
            let err = Error::RpcRejected {
                method: "bdev_uring_resize".into(),
                target: req.bdev_name,
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    async fn create_lvstore_from_nvme_ids(&self, req: AttachNvmeRequest) -> Result<LvStoreInfo> {
        let client = self.client().await?;

        let mut base_bdevs = Vec::new();
        for (idx, traddr) in req.devices.iter().enumerate() {
            let ctrlr = format!("nvme{}", idx);
            let ns_bdev = format!("{}n1", ctrlr);
            if Self::bdev_exists(&client, &ns_bdev).await? {
                info!("controller {} at {} already attached", ctrlr, traddr);
                base_bdevs.push(ns_bdev);
                continue;
            }

            info!("attaching NVMe controller {} at {}", ctrlr, traddr);
            let names = client
                .bdev_nvme_attach_controller(BdevNvmeAttachControllerReq {
                    name: ctrlr.clone(),
                    trtype: "PCIe".to_string(),
                    traddr: traddr.clone(),
                })
                .await?;
            if names.is_empty() {
                warn!("controller {} at {} exposed no namespaces", ctrlr, traddr);
            }
            base_bdevs.extend(names);
        }

        Self::assemble_lvstore(&client, base_bdevs, &req.raid_name, &req.lvs_name).await
    }

    async fn create_lvstore_from_nvme_device_paths(
        &self,
        req: AttachNvmeRequest,
    ) -> Result<LvStoreInfo> {
        let client = self.client().await?;

        let base_bdevs = req
            .devices
            .iter()
            .map(|path| bdev_name_for_path(path))
            .collect::<Result<Vec<_>>>()?;

        Self::assemble_lvstore(&client, base_bdevs, &req.raid_name, &req.lvs_name).await
    }
}

/// Bdev name derived from a device path's final component
pub fn bdev_name_for_path(path: &str) -> Result<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| Error::device(path, "path has no final component"))
}
