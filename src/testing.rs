//! In-memory fakes for every port, shared by the unit test suites.

use crate::config::{PciSettleConfig, PoolMode, StorageStack};
use crate::domain::ports::{
    Bdev, KmodUtility, LoopDeviceUtility, LvStoreInfo, LvmUtility, NvmeUtility, PciUtility,
    VolumeGroup,
};
use crate::error::{Error, Result, SPDK_ENODEV};
use crate::hardware::{CommandOutput, ShellExec};
use crate::pool::{LvmPoolEngine, PoolBuilder, PoolBuilderDeps};
use crate::spdk::{RpcConnector, RpcTransport, RpcTransportRef, SpdkService};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Commands
// =============================================================================

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Answers commands by prefix; unmatched commands succeed with no output
#[derive(Default)]
pub struct ScriptedExec {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.responses.lock().push((prefix.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ShellExec for ScriptedExec {
    async fn exec_cmd(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().push(line.clone());

        Ok(self
            .responses
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| ok("")))
    }
}

// =============================================================================
// SPDK
// =============================================================================

const READ_METHODS: [&str; 2] = ["bdev_get_bdevs", "bdev_lvol_get_lvstores"];
const FAKE_CLUSTER_SIZE: u64 = 4 * 1024 * 1024;
const FAKE_DEVICE_BLOCKS: u64 = 1 << 21;

#[derive(Default)]
struct SpdkState {
    bdevs: BTreeMap<String, Bdev>,
    lvstores: Vec<LvStoreInfo>,
    calls: Vec<(String, Value)>,
    rejected: HashSet<String>,
    failures: HashMap<String, (i64, String)>,
}

/// A small in-memory SPDK target speaking the JSON-RPC methods the agent uses
#[derive(Default)]
pub struct FakeSpdk {
    state: Mutex<SpdkState>,
    closed: AtomicBool,
}

fn enodev(method: &str) -> Error {
    Error::Rpc {
        method: method.to_string(),
        code: SPDK_ENODEV,
        message: "No such device".into(),
    }
}

fn str_param(params: &Value, key: &str) -> String {
    params[key].as_str().unwrap_or_default().to_string()
}

impl FakeSpdk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bdev(&self, name: &str, block_size: u64, num_blocks: u64) {
        self.state.lock().bdevs.insert(
            name.to_string(),
            Bdev {
                name: name.to_string(),
                product_name: "Malloc disk".into(),
                uuid: format!("uuid-{}", name),
                block_size,
                num_blocks,
            },
        );
    }

    pub fn has_bdev(&self, name: &str) -> bool {
        self.state.lock().bdevs.contains_key(name)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().calls.clone()
    }

    /// Methods of every non-query call, in order
    pub fn mutations(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(m, _)| m.clone())
            .filter(|m| !READ_METHODS.contains(&m.as_str()))
            .collect()
    }

    pub fn last_call(&self, method: &str) -> Option<Value> {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }

    /// Make `method` answer `false`
    pub fn reject_method(&self, method: &str) {
        self.state.lock().rejected.insert(method.to_string());
    }

    pub fn fail_method(&self, method: &str, code: i64, message: &str) {
        self.state
            .lock()
            .failures
            .insert(method.to_string(), (code, message.to_string()));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn handle(state: &mut SpdkState, method: &str, params: &Value) -> Result<Value> {
        let rejected = state.rejected.contains(method);

        match method {
            "bdev_get_bdevs" => match params["name"].as_str() {
                Some(name) => state
                    .bdevs
                    .get(name)
                    .map(|b| json!([b]))
                    .ok_or_else(|| enodev(method)),
                None => Ok(json!(state.bdevs.values().collect::<Vec<_>>())),
            },
            "bdev_aio_create" | "bdev_uring_create" | "bdev_malloc_create" => {
                let name = str_param(params, "name");
                let num_blocks = params["num_blocks"].as_u64().unwrap_or(FAKE_DEVICE_BLOCKS);
                state.bdevs.insert(
                    name.clone(),
                    Bdev {
                        name: name.clone(),
                        product_name: method.to_string(),
                        uuid: format!("uuid-{}", name),
                        block_size: params["block_size"].as_u64().unwrap_or(512),
                        num_blocks,
                    },
                );
                Ok(json!(name))
            }
            "bdev_aio_delete" | "bdev_uring_delete" | "bdev_malloc_delete" => {
                if rejected {
                    return Ok(json!(false));
                }
                let name = str_param(params, "name");
                state.bdevs.remove(&name).ok_or_else(|| enodev(method))?;
                Ok(json!(true))
            }
            "bdev_uring_resize" => Ok(json!(!rejected)),
            "bdev_lvol_get_lvstores" => {
                let uuid = params["uuid"].as_str();
                let lvs_name = params["lvs_name"].as_str();
                let list: Vec<_> = state
                    .lvstores
                    .iter()
                    .filter(|l| uuid.map_or(true, |u| l.uuid == u))
                    .filter(|l| lvs_name.map_or(true, |n| l.name == n))
                    .cloned()
                    .collect();
                if list.is_empty() && (uuid.is_some() || lvs_name.is_some()) {
                    return Err(enodev(method));
                }
                Ok(json!(list))
            }
            "bdev_lvol_create_lvstore" => {
                let bdev_name = str_param(params, "bdev_name");
                let lvs_name = str_param(params, "lvs_name");
                let (block_size, num_blocks) = state
                    .bdevs
                    .get(&bdev_name)
                    .map(|b| (b.block_size, b.num_blocks))
                    .ok_or_else(|| enodev(method))?;

                let bytes = block_size * num_blocks;
                let cluster_size = if bytes >= FAKE_CLUSTER_SIZE {
                    FAKE_CLUSTER_SIZE
                } else {
                    block_size
                };
                let uuid = format!("uuid-{}", lvs_name);
                state.lvstores.push(LvStoreInfo {
                    uuid: uuid.clone(),
                    name: lvs_name,
                    base_bdev: bdev_name,
                    total_data_clusters: bytes / cluster_size,
                    free_clusters: bytes / cluster_size,
                    block_size,
                    cluster_size,
                });
                Ok(json!(uuid))
            }
            "bdev_nvme_attach_controller" => {
                let ns = format!("{}n1", str_param(params, "name"));
                state.bdevs.insert(
                    ns.clone(),
                    Bdev {
                        name: ns.clone(),
                        product_name: "NVMe disk".into(),
                        uuid: format!("uuid-{}", ns),
                        block_size: 512,
                        num_blocks: FAKE_DEVICE_BLOCKS,
                    },
                );
                Ok(json!([ns]))
            }
            "bdev_raid_create" => {
                if rejected {
                    return Ok(json!(false));
                }
                let name = str_param(params, "name");
                let mut num_blocks = 0;
                for base in params["base_bdevs"].as_array().into_iter().flatten() {
                    let base = base.as_str().unwrap_or_default();
                    num_blocks += state
                        .bdevs
                        .get(base)
                        .ok_or_else(|| enodev(method))?
                        .num_blocks;
                }
                state.bdevs.insert(
                    name.clone(),
                    Bdev {
                        name: name.clone(),
                        product_name: "Raid Volume".into(),
                        uuid: format!("uuid-{}", name),
                        block_size: 512,
                        num_blocks,
                    },
                );
                Ok(json!(true))
            }
            _ => Err(Error::Rpc {
                method: method.to_string(),
                code: -32601,
                message: "Method not found".into(),
            }),
        }
    }
}

#[async_trait]
impl RpcTransport for FakeSpdk {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::RpcTransport("connection closed".into()));
        }

        let params = params.unwrap_or(Value::Null);
        let mut state = self.state.lock();
        state.calls.push((method.to_string(), params.clone()));

        if let Some((code, message)) = state.failures.get(method).cloned() {
            return Err(Error::Rpc {
                method: method.to_string(),
                code,
                message,
            });
        }
        Self::handle(&mut state, method, &params)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out the same [`FakeSpdk`], reopening it on every connect
pub struct FakeConnector {
    spdk: Arc<FakeSpdk>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(spdk: Arc<FakeSpdk>) -> Arc<Self> {
        Arc::new(Self {
            spdk,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcConnector for FakeConnector {
    async fn connect(&self) -> Result<RpcTransportRef> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.spdk.reopen();
        let transport: RpcTransportRef = self.spdk.clone();
        Ok(transport)
    }
}

// =============================================================================
// LVM
// =============================================================================

#[derive(Default)]
struct LvmState {
    vgs: HashMap<String, VolumeGroup>,
    calls: Vec<String>,
    query_failure: Option<String>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeLvm {
    state: Mutex<LvmState>,
}

impl FakeLvm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_vg(&self, name: &str, total_bytes: u64) {
        self.state.lock().vgs.insert(
            name.to_string(),
            VolumeGroup {
                name: name.to_string(),
                uuid: format!("uuid-{}", name),
                total_bytes,
                free_bytes: total_bytes,
                extent_size_bytes: 4 * 1024 * 1024,
                pv_count: 1,
                lv_count: 0,
            },
        );
    }

    /// Mutating commands in order, e.g. `vgcreate vg0 /dev/loop0`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn fail_query(&self, message: &str) {
        self.state.lock().query_failure = Some(message.to_string());
    }

    /// Make the named command fail
    pub fn fail_on(&self, tool: &str) {
        self.state.lock().failing.insert(tool.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    fn run(&self, tool: &str, args: &[&str]) -> Result<()> {
        let mut state = self.state.lock();
        let line = std::iter::once(tool)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        state.calls.push(line);
        if state.failing.contains(tool) {
            return Err(Error::tool(tool, "exit code 5: device is busy"));
        }
        Ok(())
    }
}

#[async_trait]
impl LvmUtility for FakeLvm {
    async fn create_pvs(&self, paths: &[String]) -> Result<()> {
        let args: Vec<&str> = paths.iter().map(String::as_str).collect();
        self.run("pvcreate", &args)
    }

    async fn create_vg(&self, name: &str, paths: &[String]) -> Result<()> {
        let args: Vec<&str> = std::iter::once(name)
            .chain(paths.iter().map(String::as_str))
            .collect();
        self.run("vgcreate", &args)?;

        self.add_vg(name, paths.len() as u64 * (1 << 30));
        if let Some(vg) = self.state.lock().vgs.get_mut(name) {
            vg.pv_count = paths.len() as u32;
        }
        Ok(())
    }

    async fn get_vg(&self, name: &str) -> Result<VolumeGroup> {
        let state = self.state.lock();
        if let Some(message) = &state.query_failure {
            return Err(Error::tool("vgs", message.clone()));
        }
        state.vgs.get(name).cloned().ok_or_else(|| Error::VgNotFound {
            name: name.to_string(),
        })
    }
}

// =============================================================================
// Host Devices
// =============================================================================

#[derive(Default)]
struct HostState {
    files: HashMap<String, u64>,
    block_devices: HashSet<String>,
    loops: HashMap<String, String>,
    failing_attach: HashSet<String>,
    calls: Vec<String>,
}

/// Files, block devices and loop bindings of a pretend host
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_file(&self, path: &str, size: u64) {
        self.state.lock().files.insert(path.to_string(), size);
    }

    pub fn add_block_device(&self, path: &str) {
        self.state.lock().block_devices.insert(path.to_string());
    }

    pub fn attach(&self, loop_path: &str, file_path: &str) {
        self.state
            .lock()
            .loops
            .insert(loop_path.to_string(), file_path.to_string());
    }

    pub fn fail_attach(&self, loop_path: &str) {
        self.state.lock().failing_attach.insert(loop_path.to_string());
    }

    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.state.lock().files.get(path).copied()
    }

    pub fn loop_backing(&self, loop_path: &str) -> Option<String> {
        self.state.lock().loops.get(loop_path).cloned()
    }

    /// Mutating operations in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl LoopDeviceUtility for FakeHost {
    async fn path_exists(&self, path: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.files.contains_key(path)
            || state.block_devices.contains(path)
            || state.loops.contains_key(path))
    }

    async fn is_block_device(&self, path: &str) -> Result<bool> {
        let state = self.state.lock();
        if state.block_devices.contains(path) || state.loops.contains_key(path) {
            Ok(true)
        } else if state.files.contains_key(path) {
            Ok(false)
        } else {
            Err(Error::device(path, "cannot stat: No such file or directory"))
        }
    }

    async fn file_len(&self, path: &str) -> Result<u64> {
        self.file_size(path)
            .ok_or_else(|| Error::device(path, "cannot stat: No such file or directory"))
    }

    async fn loop_backing_file(&self, loop_path: &str) -> Result<Option<String>> {
        Ok(self.loop_backing(loop_path))
    }

    async fn create_sparse_file(&self, path: &str, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("create {} {}", path, size));
        state.files.insert(path.to_string(), size);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("remove {}", path));
        state.files.remove(path).map(|_| ()).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path),
            ))
        })
    }

    async fn attach_loop_device(&self, loop_path: &str, file_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("attach {} {}", loop_path, file_path));
        if state.failing_attach.contains(loop_path) {
            return Err(Error::device(loop_path, "failed to set up loop device"));
        }
        if state.loops.contains_key(loop_path) {
            return Err(Error::device(loop_path, "Device or resource busy"));
        }
        if !state.files.contains_key(file_path) {
            return Err(Error::device(loop_path, format!("{} does not exist", file_path)));
        }
        state
            .loops
            .insert(loop_path.to_string(), file_path.to_string());
        Ok(())
    }

    async fn detach_loop_device(&self, loop_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("detach {}", loop_path));
        state
            .loops
            .remove(loop_path)
            .map(|_| ())
            .ok_or_else(|| Error::device(loop_path, "not attached"))
    }
}

// =============================================================================
// Kernel Modules, PCI and NVMe
// =============================================================================

#[derive(Default)]
pub struct FakeKmod {
    loaded: Mutex<HashSet<String>>,
    probed: Mutex<Vec<String>>,
}

impl FakeKmod {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_loaded(&self, name: &str) {
        self.loaded.lock().insert(name.to_string());
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl KmodUtility for FakeKmod {
    async fn has_kmod(&self, name: &str) -> Result<bool> {
        Ok(self.loaded.lock().contains(name))
    }

    async fn probe_kmod(&self, name: &str) -> Result<()> {
        self.probed.lock().push(name.to_string());
        self.loaded.lock().insert(name.to_string());
        Ok(())
    }
}

struct Controller {
    type_id: String,
    driver: Option<String>,
}

#[derive(Default)]
struct PciState {
    controllers: BTreeMap<String, Controller>,
    held: HashSet<String>,
    calls: Vec<String>,
}

/// NVMe controllers and their driver bindings
#[derive(Default)]
pub struct FakePci {
    state: Mutex<PciState>,
}

impl FakePci {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_controller(&self, id: &str, type_id: &str, driver: Option<&str>) {
        self.state.lock().controllers.insert(
            id.to_string(),
            Controller {
                type_id: type_id.to_string(),
                driver: driver.map(String::from),
            },
        );
    }

    /// Keep `id` unbound no matter what driver claims its type
    pub fn hold_binding(&self, id: &str) {
        self.state.lock().held.insert(id.to_string());
    }

    pub fn driver_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .controllers
            .get(id)
            .and_then(|c| c.driver.clone())
    }

    /// Unbind and bind operations in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl PciUtility for FakePci {
    async fn list_nvme_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().controllers.keys().cloned().collect())
    }

    async fn check_nvme_existence(&self, id: &str, driver: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .controllers
            .get(id)
            .map_or(false, |c| c.driver.as_deref() == Some(driver)))
    }

    async fn unbind_nvme(&self, id: &str, driver: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("unbind {} {}", id, driver));
        match state.controllers.get_mut(id) {
            Some(c) if c.driver.as_deref() == Some(driver) => {
                c.driver = None;
                Ok(())
            }
            _ => Err(Error::tool("unbind", format!("{} is not bound to {}", id, driver))),
        }
    }

    async fn get_nvme_type_id(&self, id: &str) -> Result<String> {
        self.state
            .lock()
            .controllers
            .get(id)
            .map(|c| c.type_id.clone())
            .ok_or_else(|| Error::device(id, "no such PCI device"))
    }

    async fn bind_nvme_by_type(&self, type_id: &str, driver: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("bind {} {}", type_id, driver));
        let PciState {
            controllers, held, ..
        } = &mut *state;
        for (id, c) in controllers.iter_mut() {
            if c.type_id == type_id && c.driver.is_none() && !held.contains(id) {
                c.driver = Some(driver.to_string());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNvme {
    paths: Mutex<Vec<String>>,
}

impl FakeNvme {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_paths(&self, paths: Vec<String>) {
        *self.paths.lock() = paths;
    }
}

#[async_trait]
impl NvmeUtility for FakeNvme {
    async fn list_nvme_paths(&self) -> Result<Vec<String>> {
        Ok(self.paths.lock().clone())
    }
}

// =============================================================================
// Builder Fixture
// =============================================================================

/// Every fake wired into a [`PoolBuilder`]
pub struct Fixture {
    pub spdk: Arc<FakeSpdk>,
    pub host: Arc<FakeHost>,
    pub lvm: Arc<FakeLvm>,
    pub kmod: Arc<FakeKmod>,
    pub pci: Arc<FakePci>,
    pub nvme: Arc<FakeNvme>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            spdk: FakeSpdk::new(),
            host: FakeHost::new(),
            lvm: FakeLvm::new(),
            kmod: FakeKmod::new(),
            pci: FakePci::new(),
            nvme: FakeNvme::new(),
        }
    }

    pub fn deps(&self) -> PoolBuilderDeps {
        PoolBuilderDeps {
            engine: Arc::new(LvmPoolEngine::new(self.lvm.clone())),
            spdk: Arc::new(SpdkService::new(
                FakeConnector::new(self.spdk.clone()),
                self.host.clone(),
            )),
            kmod: self.kmod.clone(),
            pci: self.pci.clone(),
            nvme: self.nvme.clone(),
            loops: self.host.clone(),
            lvm: self.lvm.clone(),
        }
    }

    pub fn builder(&self, mode: PoolMode, stack: StorageStack) -> PoolBuilder {
        let settle = PciSettleConfig {
            poll_interval_ms: 1,
            timeout_ms: 20,
        };
        PoolBuilder::new(mode, stack, settle, self.deps())
    }
}
